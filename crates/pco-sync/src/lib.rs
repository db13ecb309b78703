//! Reconciliation of one incoming outreach record against the stored
//! curator → playlist → campaign hierarchy.
//!
//! A run is split in two: [`plan`] is pure and decides, per level, whether to
//! update, insert or leave the row alone; [`Reconciler::execute`] then applies
//! the plan through a [`PersistenceGateway`], one transaction per level.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use pco_core::{
    diff, has_real_change, match_campaign, match_channel, CampaignField, ChannelField, ChildMatch,
    CuratorField, CuratorHierarchy, EntityField, FieldValue, IncomingRecord, Record,
    ValidationError,
};
use pco_storage::{
    connect_with_retry, BackoffPolicy, GatewayError, PersistenceGateway, PgGateway, PoolConfig,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

const CURATOR_ANCHORS: &[CuratorField] = &[CuratorField::ExternalUserId];
const CHANNEL_ANCHORS: &[ChannelField] = &[ChannelField::ExternalChannelId];
const CAMPAIGN_ANCHORS: &[CampaignField] = &[CampaignField::CampaignId];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    Validate,
    Fetch,
    DiffCurator,
    DiffChannel,
    DiffCampaign,
    Decide,
    ApplyCurator,
    ResolveCuratorId,
    ApplyChannel,
    ApplyCampaign,
    Done,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "VALIDATE",
            Self::Fetch => "FETCH",
            Self::DiffCurator => "DIFF_CURATOR",
            Self::DiffChannel => "DIFF_CHANNEL",
            Self::DiffCampaign => "DIFF_CAMPAIGN",
            Self::Decide => "DECIDE",
            Self::ApplyCurator => "APPLY_CURATOR",
            Self::ResolveCuratorId => "RESOLVE_CURATOR_ID",
            Self::ApplyChannel => "APPLY_CHANNEL",
            Self::ApplyCampaign => "APPLY_CAMPAIGN",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// What to do when stored children share the incoming natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Fail the run with [`ReconcileError::AmbiguousMatch`] before any write.
    #[default]
    Reject,
    FirstMatch,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "first-match" | "first_match" => Ok(Self::FirstMatch),
            other => Err(format!("unknown duplicate policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub pool: PoolConfig,
    pub duplicate_policy: DuplicatePolicy,
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let defaults = PoolConfig::default();
        Self {
            pool: PoolConfig {
                database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
                max_connections: std::env::var("PCO_DB_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_connections),
                acquire_timeout: std::env::var("PCO_DB_ACQUIRE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.acquire_timeout),
                backoff: BackoffPolicy {
                    max_retries: std::env::var("PCO_DB_CONNECT_RETRIES")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(defaults.backoff.max_retries),
                    ..defaults.backoff
                },
            },
            duplicate_policy: duplicate_policy_or_default(
                std::env::var("PCO_DUPLICATE_POLICY").ok().as_deref(),
            ),
        }
    }
}

fn duplicate_policy_or_default(raw: Option<&str>) -> DuplicatePolicy {
    match raw.map(str::parse::<DuplicatePolicy>) {
        None => DuplicatePolicy::default(),
        Some(Ok(policy)) => policy,
        Some(Err(err)) => {
            let fallback = DuplicatePolicy::default();
            warn!(error = %err, ?fallback, "ignoring PCO_DUPLICATE_POLICY");
            fallback
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid incoming record: {0}")]
    Invalid(#[from] ValidationError),
    #[error("curator {external_user_id} not found")]
    NotFound { external_user_id: String },
    #[error("storage call failed for {keys}: {source}")]
    Persistence {
        keys: String,
        #[source]
        source: GatewayError,
    },
    #[error("{occurrences} stored {table} rows share natural key {key}")]
    AmbiguousMatch {
        table: &'static str,
        key: String,
        occurrences: usize,
    },
}

/// A failed run: the step that failed, why, and which write steps had
/// already committed (those are not undone).
#[derive(Debug, Error)]
#[error("{step}: {error}")]
pub struct ReconcileFailure {
    pub step: Step,
    #[source]
    pub error: ReconcileError,
    pub committed: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub curator_id: i64,
    /// Set when a playlist row was written or keyed a campaign write.
    pub channel_id: Option<i64>,
    pub campaign_touched: bool,
    pub committed: Vec<Step>,
}

pub type Outcome = std::result::Result<ReconcileSummary, ReconcileFailure>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "fields", rename_all = "snake_case")]
pub enum LevelAction<F: EntityField + Serialize> {
    Unchanged,
    Update(Record<F>),
    Insert(Record<F>),
}

impl<F: EntityField + Serialize> LevelAction<F> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CuratorPlan {
    pub external_user_id: String,
    pub curator_id: i64,
    pub action: LevelAction<CuratorField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelPlan {
    pub external_channel_id: String,
    pub matched_channel_id: Option<i64>,
    pub action: LevelAction<ChannelField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignPlan {
    pub campaign_id: i64,
    pub action: LevelAction<CampaignField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcilePlan {
    pub curator: CuratorPlan,
    pub channel: Option<ChannelPlan>,
    pub campaign: Option<CampaignPlan>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.curator.action.is_unchanged()
            && self.channel.as_ref().map_or(true, |c| c.action.is_unchanged())
            && self.campaign.as_ref().map_or(true, |c| c.action.is_unchanged())
    }
}

fn fail(step: Step, error: ReconcileError, committed: &[Step]) -> ReconcileFailure {
    ReconcileFailure {
        step,
        error,
        committed: committed.to_vec(),
    }
}

fn resolve_match<'a, T>(
    found: ChildMatch<'a, T>,
    policy: DuplicatePolicy,
    table: &'static str,
    key: &dyn fmt::Display,
) -> std::result::Result<Option<&'a T>, ReconcileError> {
    match found {
        ChildMatch::Duplicated { first, occurrences } => match policy {
            DuplicatePolicy::Reject => Err(ReconcileError::AmbiguousMatch {
                table,
                key: key.to_string(),
                occurrences,
            }),
            DuplicatePolicy::FirstMatch => {
                warn!(table, %key, occurrences, "duplicate natural key; using first stored row");
                Ok(Some(first))
            }
        },
        other => Ok(other.candidate()),
    }
}

pub fn plan(
    incoming: &IncomingRecord,
    stored: &CuratorHierarchy,
    policy: DuplicatePolicy,
) -> std::result::Result<ReconcilePlan, ReconcileFailure> {
    let external_user_id = incoming.external_user_id().unwrap_or_default().to_string();
    let Some(curator) = &stored.curator else {
        return Err(fail(
            Step::Fetch,
            ReconcileError::NotFound { external_user_id },
            &[],
        ));
    };

    let curator_changes = diff(Some(&curator.fields), &incoming.curator, CURATOR_ANCHORS);
    let curator_action = if has_real_change(&curator_changes, CURATOR_ANCHORS) {
        LevelAction::Update(curator_changes)
    } else {
        LevelAction::Unchanged
    };

    let mut channel_plan = None;
    if let Some(channel) = &incoming.channel {
        let external_channel_id = incoming.external_channel_id().unwrap_or_default();
        let matched = resolve_match(
            match_channel(&stored.channels, external_channel_id),
            policy,
            ChannelField::TABLE,
            &external_channel_id,
        )
        .map_err(|err| fail(Step::DiffChannel, err, &[]))?;

        channel_plan = Some(match matched {
            Some(old) => {
                let changes = diff(Some(&old.fields), channel, CHANNEL_ANCHORS);
                ChannelPlan {
                    external_channel_id: external_channel_id.to_string(),
                    matched_channel_id: Some(old.channel_id),
                    action: if has_real_change(&changes, CHANNEL_ANCHORS) {
                        LevelAction::Update(changes)
                    } else {
                        LevelAction::Unchanged
                    },
                }
            }
            None => ChannelPlan {
                external_channel_id: external_channel_id.to_string(),
                matched_channel_id: None,
                action: LevelAction::Insert(channel.clone()),
            },
        });
    }

    let mut campaign_plan = None;
    if let Some(campaign) = &incoming.campaign {
        let campaign_id = incoming.campaign_id().unwrap_or_default();
        let owner = channel_plan.as_ref().and_then(|c| c.matched_channel_id);
        // Only campaigns on the matched playlist are candidates; a new
        // playlist cannot own any yet.
        let candidates = stored
            .campaigns
            .iter()
            .filter(|c| Some(c.channel_id) == owner);
        let matched = resolve_match(
            match_campaign(candidates, campaign_id),
            policy,
            CampaignField::TABLE,
            &campaign_id,
        )
        .map_err(|err| fail(Step::DiffCampaign, err, &[]))?;

        campaign_plan = Some(match matched {
            Some(old) => {
                let changes = diff(Some(&old.fields), campaign, CAMPAIGN_ANCHORS);
                CampaignPlan {
                    campaign_id,
                    action: if has_real_change(&changes, CAMPAIGN_ANCHORS) {
                        LevelAction::Update(changes)
                    } else {
                        LevelAction::Unchanged
                    },
                }
            }
            None => CampaignPlan {
                campaign_id,
                action: LevelAction::Insert(campaign.clone()),
            },
        });
    }

    Ok(ReconcilePlan {
        curator: CuratorPlan {
            external_user_id,
            curator_id: curator.curator_id,
            action: curator_action,
        },
        channel: channel_plan,
        campaign: campaign_plan,
    })
}

fn stamped<F: EntityField>(fields: &Record<F>, last_edited: F, now: NaiveDateTime) -> Record<F> {
    let mut fields = fields.clone();
    fields.insert(last_edited, FieldValue::Timestamp(now));
    fields
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    policy: DuplicatePolicy,
    clock: fn() -> NaiveDateTime,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            policy: DuplicatePolicy::default(),
            clock: local_now,
        }
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Source of the `lastedited` stamp written on playlist and campaign rows.
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub async fn plan<G: PersistenceGateway + ?Sized>(
        &self,
        gateway: &G,
        incoming: &IncomingRecord,
    ) -> std::result::Result<ReconcilePlan, ReconcileFailure> {
        incoming
            .validate()
            .map_err(|err| fail(Step::Validate, err.into(), &[]))?;
        let external_user_id = incoming.external_user_id().unwrap_or_default();

        let stored = gateway
            .fetch_curator_with_children(external_user_id)
            .instrument(info_span!("step", step = %Step::Fetch))
            .await
            .map_err(|source| {
                fail(
                    Step::Fetch,
                    ReconcileError::Persistence {
                        keys: format!("spotifyuserid={external_user_id}"),
                        source,
                    },
                    &[],
                )
            })?;

        let plan = plan(incoming, &stored, self.policy)?;
        debug!(?plan, "plan built");
        Ok(plan)
    }

    pub async fn reconcile<G: PersistenceGateway + ?Sized>(
        &self,
        gateway: &G,
        incoming: &IncomingRecord,
    ) -> Outcome {
        let span = info_span!(
            "reconcile",
            external_user_id = incoming.external_user_id().unwrap_or_default()
        );
        async move {
            let plan = self.plan(gateway, incoming).await?;
            self.execute(gateway, &plan).await
        }
        .instrument(span)
        .await
    }

    /// Apply a plan level by level. Each write commits on its own; a failure
    /// stops the run but keeps what already committed.
    pub async fn execute<G: PersistenceGateway + ?Sized>(
        &self,
        gateway: &G,
        plan: &ReconcilePlan,
    ) -> Outcome {
        let mut committed = Vec::new();
        let external_user_id = plan.curator.external_user_id.as_str();

        if plan.is_noop() {
            info!(curator_id = plan.curator.curator_id, "no changes to apply");
            return Ok(ReconcileSummary {
                curator_id: plan.curator.curator_id,
                channel_id: None,
                campaign_touched: false,
                committed,
            });
        }

        if let LevelAction::Update(changes) = &plan.curator.action {
            gateway
                .update_curator(external_user_id, changes)
                .instrument(info_span!("step", step = %Step::ApplyCurator))
                .await
                .map_err(|source| {
                    fail(
                        Step::ApplyCurator,
                        ReconcileError::Persistence {
                            keys: format!("spotifyuserid={external_user_id}"),
                            source,
                        },
                        &committed,
                    )
                })?;
            committed.push(Step::ApplyCurator);
            info!(fields = changes.len(), "curator updated");
        }

        let refreshed = gateway
            .fetch_curator_with_children(external_user_id)
            .instrument(info_span!("step", step = %Step::ResolveCuratorId))
            .await
            .map_err(|source| {
                fail(
                    Step::ResolveCuratorId,
                    ReconcileError::Persistence {
                        keys: format!("spotifyuserid={external_user_id}"),
                        source,
                    },
                    &committed,
                )
            })?;
        let curator_id = refreshed.curator.map(|c| c.curator_id).ok_or_else(|| {
            fail(
                Step::ResolveCuratorId,
                ReconcileError::NotFound {
                    external_user_id: external_user_id.to_string(),
                },
                &committed,
            )
        })?;

        let now = (self.clock)();
        let mut channel_id = None;
        let mut channel_written = false;

        if let Some(channel) = &plan.channel {
            channel_id = channel.matched_channel_id;
            let keys = || {
                format!(
                    "playlistspotifyid={}, playlisterid={curator_id}",
                    channel.external_channel_id
                )
            };
            let step_span = info_span!("step", step = %Step::ApplyChannel);

            match &channel.action {
                LevelAction::Update(changes) => {
                    let fields = stamped(changes, ChannelField::LastEdited, now);
                    gateway
                        .update_channel(&channel.external_channel_id, curator_id, &fields)
                        .instrument(step_span)
                        .await
                        .map_err(|source| {
                            fail(
                                Step::ApplyChannel,
                                ReconcileError::Persistence { keys: keys(), source },
                                &committed,
                            )
                        })?;
                    channel_written = true;
                    committed.push(Step::ApplyChannel);
                    info!(channel_id = ?channel_id, "playlist updated");
                }
                LevelAction::Insert(fields) => {
                    let fields = stamped(fields, ChannelField::LastEdited, now);
                    let generated = gateway
                        .insert_channel(curator_id, &fields)
                        .instrument(step_span)
                        .await
                        .map_err(|source| {
                            fail(
                                Step::ApplyChannel,
                                ReconcileError::Persistence { keys: keys(), source },
                                &committed,
                            )
                        })?;
                    channel_id = Some(generated);
                    channel_written = true;
                    committed.push(Step::ApplyChannel);
                    info!(channel_id = generated, "playlist inserted");
                }
                LevelAction::Unchanged => debug!(channel_id = ?channel_id, "playlist unchanged"),
            }
        }

        let mut campaign_touched = false;
        match (&plan.campaign, channel_id) {
            (Some(campaign), Some(channel_id)) => {
                let keys = || {
                    format!(
                        "campaignid={}, playlistid={channel_id}, playlisterid={curator_id}",
                        campaign.campaign_id
                    )
                };
                let step_span = info_span!("step", step = %Step::ApplyCampaign);

                let written = match &campaign.action {
                    LevelAction::Update(changes) => {
                        let fields = stamped(changes, CampaignField::LastEdited, now);
                        gateway
                            .update_campaign(campaign.campaign_id, channel_id, curator_id, &fields)
                            .instrument(step_span)
                            .await
                            .map(|()| true)
                    }
                    LevelAction::Insert(fields) => {
                        let fields = stamped(fields, CampaignField::LastEdited, now);
                        gateway
                            .insert_campaign(curator_id, channel_id, &fields)
                            .instrument(step_span)
                            .await
                            .map(|()| true)
                    }
                    LevelAction::Unchanged => Ok(false),
                };
                campaign_touched = written.map_err(|source| {
                    fail(
                        Step::ApplyCampaign,
                        ReconcileError::Persistence { keys: keys(), source },
                        &committed,
                    )
                })?;
                if campaign_touched {
                    committed.push(Step::ApplyCampaign);
                    info!(campaign_id = campaign.campaign_id, channel_id, "campaign written");
                }
            }
            (Some(campaign), None) => {
                warn!(campaign_id = campaign.campaign_id, "no playlist id available; campaign skipped");
            }
            (None, _) => {}
        }

        Ok(ReconcileSummary {
            curator_id,
            channel_id: channel_id.filter(|_| channel_written || campaign_touched),
            campaign_touched,
            committed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeReport {
    pub ok: bool,
    pub curator_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub campaign_touched: bool,
    pub committed: Vec<Step>,
    pub failed_step: Option<Step>,
    pub reason: Option<String>,
}

impl From<&Outcome> for OutcomeReport {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Ok(summary) => Self {
                ok: true,
                curator_id: Some(summary.curator_id),
                channel_id: summary.channel_id,
                campaign_touched: summary.campaign_touched,
                committed: summary.committed.clone(),
                failed_step: None,
                reason: None,
            },
            Err(failure) => Self {
                ok: false,
                curator_id: None,
                channel_id: None,
                campaign_touched: false,
                committed: failure.committed.clone(),
                failed_step: Some(failure.step),
                reason: Some(failure.error.to_string()),
            },
        }
    }
}

impl OutcomeReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub fn render_outcome(outcome: &Outcome) -> String {
    match outcome {
        Ok(summary) if summary.committed.is_empty() => {
            format!("No changes.\nPlaylister ID: {}", summary.curator_id)
        }
        Ok(summary) => {
            let channel = summary
                .channel_id
                .map_or_else(|| "unchanged".to_string(), |id| id.to_string());
            format!(
                "Update successful.\nPlaylist ID: {channel}\nPlaylister ID: {}",
                summary.curator_id
            )
        }
        Err(failure) => {
            let mut text = format!("FAIL: {failure}");
            if !failure.committed.is_empty() {
                let steps = failure
                    .committed
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                text.push_str(&format!("\nCommitted before failure: {steps}"));
            }
            text
        }
    }
}

pub async fn connect_gateway(config: &ReconcileConfig) -> Result<PgGateway> {
    let pool = connect_with_retry(&config.pool).await?;
    Ok(PgGateway::new(pool))
}

pub async fn reconcile_from_env(incoming: &IncomingRecord) -> Result<Outcome> {
    let config = ReconcileConfig::from_env();
    let gateway = connect_gateway(&config).await?;
    let reconciler = Reconciler::new().with_duplicate_policy(config.duplicate_policy);
    Ok(reconciler.reconcile(&gateway, incoming).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pco_core::{StoredCampaign, StoredChannel, StoredCurator};

    fn stored() -> CuratorHierarchy {
        let mut curator = Record::new();
        curator.insert(CuratorField::ExternalUserId, FieldValue::from("u1"));
        curator.insert(CuratorField::Email, FieldValue::from(" a@x.com "));
        curator.insert(
            CuratorField::LastContacted,
            NaiveDate::from_ymd_opt(2024, 1, 5)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .into(),
        );

        let mut channel = Record::new();
        channel.insert(ChannelField::ExternalChannelId, FieldValue::from("pl-1"));
        channel.insert(ChannelField::Followers, FieldValue::Integer(100));

        let mut campaign = Record::new();
        campaign.insert(CampaignField::CampaignId, FieldValue::Integer(7));
        campaign.insert(CampaignField::PlacementStatus, FieldValue::from("Not yet"));

        CuratorHierarchy {
            curator: Some(StoredCurator {
                curator_id: 1,
                fields: curator,
            }),
            channels: vec![StoredChannel {
                channel_id: 10,
                curator_id: 1,
                fields: channel,
            }],
            campaigns: vec![StoredCampaign {
                channel_id: 10,
                curator_id: 1,
                fields: campaign,
            }],
        }
    }

    fn incoming() -> IncomingRecord {
        IncomingRecord::new("u1")
            .with_curator(CuratorField::Email, " a@x.com")
            .with_curator(
                CuratorField::LastContacted,
                NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            )
            .with_channel(ChannelField::ExternalChannelId, "pl-1")
            .with_channel(ChannelField::Followers, 100_i64)
            .with_campaign(CampaignField::CampaignId, 7_i64)
            .with_campaign(CampaignField::PlacementStatus, "Not yet")
    }

    #[test]
    fn identical_record_plans_nothing() {
        let plan = plan(&incoming(), &stored(), DuplicatePolicy::Reject).expect("plan");
        assert!(plan.is_noop());
        assert_eq!(plan.channel.as_ref().and_then(|c| c.matched_channel_id), Some(10));
    }

    #[test]
    fn missing_curator_fails_at_fetch() {
        let failure = plan(&incoming(), &CuratorHierarchy::default(), DuplicatePolicy::Reject)
            .unwrap_err();
        assert_eq!(failure.step, Step::Fetch);
        assert!(matches!(failure.error, ReconcileError::NotFound { .. }));
    }

    #[test]
    fn unmatched_playlist_inserts_and_campaign_follows() {
        let record = incoming().with_channel(ChannelField::ExternalChannelId, "pl-new");
        let plan = plan(&record, &stored(), DuplicatePolicy::Reject).expect("plan");
        let channel = plan.channel.expect("channel plan");
        assert_eq!(channel.matched_channel_id, None);
        assert!(matches!(channel.action, LevelAction::Insert(_)));
        // The stored campaign 7 lives on a different playlist.
        assert!(matches!(
            plan.campaign.map(|c| c.action),
            Some(LevelAction::Insert(_))
        ));
    }

    #[test]
    fn campaign_change_is_an_update_with_anchor() {
        let record = incoming().with_campaign(CampaignField::PlacementStatus, "Placed");
        let plan = plan(&record, &stored(), DuplicatePolicy::Reject).expect("plan");
        let Some(CampaignPlan {
            action: LevelAction::Update(changes),
            ..
        }) = plan.campaign
        else {
            panic!("expected campaign update");
        };
        assert_eq!(
            changes.keys().copied().collect::<Vec<_>>(),
            vec![CampaignField::CampaignId, CampaignField::PlacementStatus]
        );
    }

    #[test]
    fn duplicate_playlists_are_rejected_by_default() {
        let mut hierarchy = stored();
        let mut twin = hierarchy.channels[0].clone();
        twin.channel_id = 11;
        hierarchy.channels.push(twin);

        let failure = plan(&incoming(), &hierarchy, DuplicatePolicy::Reject).unwrap_err();
        assert_eq!(failure.step, Step::DiffChannel);
        assert!(matches!(
            failure.error,
            ReconcileError::AmbiguousMatch { occurrences: 2, table: "playlists", .. }
        ));

        let plan = plan(&incoming(), &hierarchy, DuplicatePolicy::FirstMatch).expect("plan");
        assert_eq!(plan.channel.and_then(|c| c.matched_channel_id), Some(10));
    }

    #[test]
    fn duplicate_policy_parses_env_spellings() {
        assert_eq!(
            "first-match".parse::<DuplicatePolicy>(),
            Ok(DuplicatePolicy::FirstMatch)
        );
        assert_eq!(" Reject ".parse::<DuplicatePolicy>(), Ok(DuplicatePolicy::Reject));
        assert!("sometimes".parse::<DuplicatePolicy>().is_err());
    }

    #[test]
    fn unparseable_policy_falls_back_to_reject() {
        assert_eq!(duplicate_policy_or_default(None), DuplicatePolicy::Reject);
        assert_eq!(
            duplicate_policy_or_default(Some("first_match")),
            DuplicatePolicy::FirstMatch
        );
        assert_eq!(
            duplicate_policy_or_default(Some("firstmatch")),
            DuplicatePolicy::Reject
        );
    }

    #[test]
    fn failure_rendering_lists_committed_steps() {
        let outcome: Outcome = Err(ReconcileFailure {
            step: Step::ApplyChannel,
            error: ReconcileError::Persistence {
                keys: "playlistspotifyid=pl-1, playlisterid=1".to_string(),
                source: GatewayError::Rejected("boom".to_string()),
            },
            committed: vec![Step::ApplyCurator],
        });
        let text = render_outcome(&outcome);
        assert!(text.starts_with("FAIL: APPLY_CHANNEL: storage call failed"));
        assert!(text.ends_with("Committed before failure: APPLY_CURATOR"));

        let report = OutcomeReport::from(&outcome);
        assert!(!report.ok);
        let json: serde_json::Value =
            serde_json::from_str(&report.to_json().expect("json")).expect("parse");
        assert_eq!(json["failed_step"], "APPLY_CHANNEL");
        assert_eq!(json["committed"][0], "APPLY_CURATOR");
    }
}
