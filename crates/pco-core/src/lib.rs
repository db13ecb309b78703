//! Core domain model for curator outreach reconciliation.
//!
//! Three fixed entity shapes (curator, playlist channel, campaign) are modelled
//! as typed field enums over a shared [`FieldValue`]. Everything in this crate
//! is pure: no I/O, no clocks.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;

pub mod diff;
pub mod matcher;

pub use diff::{apply, diff, has_real_change};
pub use matcher::{match_campaign, match_channel, match_first, ChildMatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnKind {
    Text,
    Integer,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether this value can be stored in a column of `kind`. Dates and
    /// timestamps are interchangeable; null fits anywhere.
    pub fn fits(&self, kind: ColumnKind) -> bool {
        match (self, kind) {
            (Self::Null, _) => true,
            (Self::Text(_), ColumnKind::Text) => true,
            (Self::Integer(_), ColumnKind::Integer) => true,
            (Self::Date(_) | Self::Timestamp(_), ColumnKind::Date | ColumnKind::Timestamp) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Date(d) => write!(f, "{d}"),
            Self::Timestamp(ts) => write!(f, "{ts}"),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDateTime> for FieldValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

pub trait EntityField: Copy + Ord + fmt::Debug + Send + Sync + 'static {
    const TABLE: &'static str;
    const ALL: &'static [Self];

    fn column(self) -> &'static str;
    fn kind(self) -> ColumnKind;
}

/// Field name → value. Ordered so generated statements are deterministic.
pub type Record<F> = BTreeMap<F, FieldValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CuratorField {
    #[serde(rename = "spotifyuserid")]
    ExternalUserId,
    #[serde(rename = "curatorfullname")]
    FullName,
    #[serde(rename = "firstname")]
    FirstName,
    #[serde(rename = "facebook")]
    Facebook,
    #[serde(rename = "fbcontactedby")]
    FacebookContactedBy,
    #[serde(rename = "instagram")]
    Instagram,
    #[serde(rename = "igcontactedby")]
    InstagramContactedBy,
    #[serde(rename = "linkedin")]
    LinkedIn,
    #[serde(rename = "followupstatus")]
    FollowUpStatus,
    #[serde(rename = "lastcontacted")]
    LastContacted,
    #[serde(rename = "preferredlanguage")]
    PreferredLanguage,
    #[serde(rename = "email")]
    Email,
}

impl EntityField for CuratorField {
    const TABLE: &'static str = "playlisters";
    const ALL: &'static [Self] = &[
        Self::ExternalUserId,
        Self::FullName,
        Self::FirstName,
        Self::Facebook,
        Self::FacebookContactedBy,
        Self::Instagram,
        Self::InstagramContactedBy,
        Self::LinkedIn,
        Self::FollowUpStatus,
        Self::LastContacted,
        Self::PreferredLanguage,
        Self::Email,
    ];

    fn column(self) -> &'static str {
        match self {
            Self::ExternalUserId => "spotifyuserid",
            Self::FullName => "curatorfullname",
            Self::FirstName => "firstname",
            Self::Facebook => "facebook",
            Self::FacebookContactedBy => "fbcontactedby",
            Self::Instagram => "instagram",
            Self::InstagramContactedBy => "igcontactedby",
            Self::LinkedIn => "linkedin",
            Self::FollowUpStatus => "followupstatus",
            Self::LastContacted => "lastcontacted",
            Self::PreferredLanguage => "preferredlanguage",
            Self::Email => "email",
        }
    }

    fn kind(self) -> ColumnKind {
        match self {
            Self::LastContacted => ColumnKind::Date,
            _ => ColumnKind::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ChannelField {
    #[serde(rename = "playlistspotifyid")]
    ExternalChannelId,
    #[serde(rename = "numberoffollowers")]
    Followers,
    #[serde(rename = "lastedited")]
    LastEdited,
}

impl EntityField for ChannelField {
    const TABLE: &'static str = "playlists";
    const ALL: &'static [Self] = &[Self::ExternalChannelId, Self::Followers, Self::LastEdited];

    fn column(self) -> &'static str {
        match self {
            Self::ExternalChannelId => "playlistspotifyid",
            Self::Followers => "numberoffollowers",
            Self::LastEdited => "lastedited",
        }
    }

    fn kind(self) -> ColumnKind {
        match self {
            Self::ExternalChannelId => ColumnKind::Text,
            Self::Followers => ColumnKind::Integer,
            Self::LastEdited => ColumnKind::Timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CampaignField {
    #[serde(rename = "campaignid")]
    CampaignId,
    #[serde(rename = "placementstatus")]
    PlacementStatus,
    #[serde(rename = "numberofmessages")]
    MessageCount,
    #[serde(rename = "referenceartists")]
    ReferenceArtists,
    #[serde(rename = "lastedited")]
    LastEdited,
}

impl EntityField for CampaignField {
    const TABLE: &'static str = "playlistcampaigns";
    const ALL: &'static [Self] = &[
        Self::CampaignId,
        Self::PlacementStatus,
        Self::MessageCount,
        Self::ReferenceArtists,
        Self::LastEdited,
    ];

    fn column(self) -> &'static str {
        match self {
            Self::CampaignId => "campaignid",
            Self::PlacementStatus => "placementstatus",
            Self::MessageCount => "numberofmessages",
            Self::ReferenceArtists => "referenceartists",
            Self::LastEdited => "lastedited",
        }
    }

    fn kind(self) -> ColumnKind {
        match self {
            Self::CampaignId | Self::MessageCount => ColumnKind::Integer,
            Self::PlacementStatus | Self::ReferenceArtists => ColumnKind::Text,
            Self::LastEdited => ColumnKind::Timestamp,
        }
    }
}

/// Generated owner/row key columns shared by the child tables.
pub const CURATOR_ID_COLUMN: &str = "playlisterid";
pub const CHANNEL_ID_COLUMN: &str = "playlistid";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredCurator {
    pub curator_id: i64,
    pub fields: Record<CuratorField>,
}

impl StoredCurator {
    pub fn external_user_id(&self) -> Option<&str> {
        self.fields
            .get(&CuratorField::ExternalUserId)
            .and_then(FieldValue::as_text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredChannel {
    pub channel_id: i64,
    pub curator_id: i64,
    pub fields: Record<ChannelField>,
}

impl StoredChannel {
    pub fn external_channel_id(&self) -> Option<&str> {
        self.fields
            .get(&ChannelField::ExternalChannelId)
            .and_then(FieldValue::as_text)
    }
}

/// Campaign rows have no generated key of their own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredCampaign {
    pub channel_id: i64,
    pub curator_id: i64,
    pub fields: Record<CampaignField>,
}

impl StoredCampaign {
    pub fn campaign_id(&self) -> Option<i64> {
        self.fields
            .get(&CampaignField::CampaignId)
            .and_then(FieldValue::as_integer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CuratorHierarchy {
    pub curator: Option<StoredCurator>,
    pub channels: Vec<StoredChannel>,
    pub campaigns: Vec<StoredCampaign>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("curator external user id is missing or empty")]
    MissingExternalUserId,
    #[error("playlist external id is missing or empty")]
    MissingExternalChannelId,
    #[error("campaign id is missing or not an integer")]
    MissingCampaignId,
    #[error("a campaign was supplied without a playlist")]
    CampaignWithoutChannel,
    #[error("{table}.{column} expects a {expected:?} value, got {value}")]
    KindMismatch {
        table: &'static str,
        column: &'static str,
        expected: ColumnKind,
        value: FieldValue,
    },
}

/// One normalized outreach record: a curator, optionally with one playlist
/// and one campaign on that playlist.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IncomingRecord {
    pub curator: Record<CuratorField>,
    pub channel: Option<Record<ChannelField>>,
    pub campaign: Option<Record<CampaignField>>,
}

impl IncomingRecord {
    pub fn new(external_user_id: impl Into<String>) -> Self {
        let mut curator = Record::new();
        curator.insert(
            CuratorField::ExternalUserId,
            FieldValue::Text(external_user_id.into()),
        );
        Self {
            curator,
            channel: None,
            campaign: None,
        }
    }

    pub fn with_curator(mut self, field: CuratorField, value: impl Into<FieldValue>) -> Self {
        self.curator.insert(field, value.into());
        self
    }

    pub fn with_channel(mut self, field: ChannelField, value: impl Into<FieldValue>) -> Self {
        self.channel
            .get_or_insert_with(Record::new)
            .insert(field, value.into());
        self
    }

    pub fn with_campaign(mut self, field: CampaignField, value: impl Into<FieldValue>) -> Self {
        self.campaign
            .get_or_insert_with(Record::new)
            .insert(field, value.into());
        self
    }

    pub fn external_user_id(&self) -> Option<&str> {
        self.curator
            .get(&CuratorField::ExternalUserId)
            .and_then(FieldValue::as_text)
    }

    pub fn external_channel_id(&self) -> Option<&str> {
        self.channel
            .as_ref()?
            .get(&ChannelField::ExternalChannelId)
            .and_then(FieldValue::as_text)
    }

    pub fn campaign_id(&self) -> Option<i64> {
        self.campaign
            .as_ref()?
            .get(&CampaignField::CampaignId)
            .and_then(FieldValue::as_integer)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.external_user_id().map_or(true, |id| id.trim().is_empty()) {
            return Err(ValidationError::MissingExternalUserId);
        }
        check_kinds(&self.curator)?;

        if let Some(channel) = &self.channel {
            if self.external_channel_id().map_or(true, |id| id.trim().is_empty()) {
                return Err(ValidationError::MissingExternalChannelId);
            }
            check_kinds(channel)?;
        }

        if let Some(campaign) = &self.campaign {
            if self.channel.is_none() {
                return Err(ValidationError::CampaignWithoutChannel);
            }
            if self.campaign_id().is_none() {
                return Err(ValidationError::MissingCampaignId);
            }
            check_kinds(campaign)?;
        }

        Ok(())
    }
}

fn check_kinds<F: EntityField>(record: &Record<F>) -> Result<(), ValidationError> {
    for (field, value) in record {
        if !value.fits(field.kind()) {
            return Err(ValidationError::KindMismatch {
                table: F::TABLE,
                column: field.column(),
                expected: field.kind(),
                value: value.clone(),
            });
        }
    }
    Ok(())
}
