//! Natural-key matching of an incoming child against its stored siblings.

use crate::{StoredCampaign, StoredChannel};

/// Result of looking up one incoming child among the stored children of its
/// parent. At most one candidate is ever handed back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildMatch<'a, T> {
    New,
    Existing(&'a T),
    /// More than one stored row shares the natural key; `first` is the
    /// earliest in supplied order.
    Duplicated { first: &'a T, occurrences: usize },
}

impl<'a, T> ChildMatch<'a, T> {
    pub fn candidate(&self) -> Option<&'a T> {
        match *self {
            Self::New => None,
            Self::Existing(row) => Some(row),
            Self::Duplicated { first, .. } => Some(first),
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

/// Scan `existing` in order and stop at the first row satisfying `is_same`,
/// counting any later rows that satisfy it too.
pub fn match_first<'a, T: 'a>(
    existing: impl IntoIterator<Item = &'a T>,
    mut is_same: impl FnMut(&T) -> bool,
) -> ChildMatch<'a, T> {
    let mut hits = existing.into_iter().filter(|row| is_same(*row));
    let Some(first) = hits.next() else {
        return ChildMatch::New;
    };
    match hits.count() {
        0 => ChildMatch::Existing(first),
        extra => ChildMatch::Duplicated {
            first,
            occurrences: extra + 1,
        },
    }
}

pub fn match_channel<'a>(
    existing: impl IntoIterator<Item = &'a StoredChannel>,
    external_channel_id: &str,
) -> ChildMatch<'a, StoredChannel> {
    match_first(existing, |channel| {
        channel.external_channel_id() == Some(external_channel_id)
    })
}

pub fn match_campaign<'a>(
    existing: impl IntoIterator<Item = &'a StoredCampaign>,
    campaign_id: i64,
) -> ChildMatch<'a, StoredCampaign> {
    match_first(existing, |campaign| campaign.campaign_id() == Some(campaign_id))
}
