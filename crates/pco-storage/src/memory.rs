//! In-process gateway with write recording and per-operation fault injection.
//! Failed calls leave state untouched, like a rolled-back transaction.

use std::collections::HashSet;

use async_trait::async_trait;
use pco_core::{
    apply, CampaignField, ChannelField, CuratorField, CuratorHierarchy, FieldValue, Record,
    StoredCampaign, StoredChannel, StoredCurator,
};
use tokio::sync::Mutex;

use crate::{GatewayError, PersistenceGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    FetchCurator,
    UpdateCurator,
    UpdateChannel,
    InsertChannel,
    UpdateCampaign,
    InsertCampaign,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedWrite {
    UpdateCurator {
        external_user_id: String,
        fields: Record<CuratorField>,
    },
    UpdateChannel {
        external_channel_id: String,
        curator_id: i64,
        fields: Record<ChannelField>,
    },
    InsertChannel {
        curator_id: i64,
        channel_id: i64,
        fields: Record<ChannelField>,
    },
    UpdateCampaign {
        campaign_id: i64,
        channel_id: i64,
        curator_id: i64,
        fields: Record<CampaignField>,
    },
    InsertCampaign {
        curator_id: i64,
        channel_id: i64,
        fields: Record<CampaignField>,
    },
}

#[derive(Debug)]
struct MemoryState {
    curators: Vec<StoredCurator>,
    channels: Vec<StoredChannel>,
    campaigns: Vec<StoredCampaign>,
    next_channel_id: i64,
    failing: HashSet<GatewayOp>,
    writes: Vec<RecordedWrite>,
    fetches: usize,
}

#[derive(Debug)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                curators: Vec::new(),
                channels: Vec::new(),
                campaigns: Vec::new(),
                next_channel_id: 1000,
                failing: HashSet::new(),
                writes: Vec::new(),
                fetches: 0,
            }),
        }
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_curator(mut self, curator: StoredCurator) -> Self {
        self.state.get_mut().curators.push(curator);
        self
    }

    pub fn with_channel(mut self, channel: StoredChannel) -> Self {
        let state = self.state.get_mut();
        state.next_channel_id = state.next_channel_id.max(channel.channel_id + 1);
        state.channels.push(channel);
        self
    }

    pub fn with_campaign(mut self, campaign: StoredCampaign) -> Self {
        self.state.get_mut().campaigns.push(campaign);
        self
    }

    /// Make every call of `op` fail with [`GatewayError::Rejected`].
    pub fn failing_on(mut self, op: GatewayOp) -> Self {
        self.state.get_mut().failing.insert(op);
        self
    }

    pub async fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().await.writes.clone()
    }

    pub async fn fetch_count(&self) -> usize {
        self.state.lock().await.fetches
    }

    pub async fn channels(&self) -> Vec<StoredChannel> {
        self.state.lock().await.channels.clone()
    }

    pub async fn campaigns(&self) -> Vec<StoredCampaign> {
        self.state.lock().await.campaigns.clone()
    }

    pub async fn curator(&self, external_user_id: &str) -> Option<StoredCurator> {
        self.state
            .lock()
            .await
            .curators
            .iter()
            .find(|c| c.external_user_id() == Some(external_user_id))
            .cloned()
    }
}

impl MemoryState {
    fn check(&self, op: GatewayOp) -> Result<(), GatewayError> {
        if self.failing.contains(&op) {
            return Err(GatewayError::Rejected(format!("injected failure on {op:?}")));
        }
        Ok(())
    }
}

fn no_rows(table: &'static str, keys: String) -> GatewayError {
    GatewayError::NoRowsAffected { table, keys }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn fetch_curator_with_children(
        &self,
        external_user_id: &str,
    ) -> Result<CuratorHierarchy, GatewayError> {
        let mut state = self.state.lock().await;
        state.check(GatewayOp::FetchCurator)?;
        state.fetches += 1;

        let Some(curator) = state
            .curators
            .iter()
            .find(|c| c.external_user_id() == Some(external_user_id))
            .cloned()
        else {
            return Ok(CuratorHierarchy::default());
        };
        let channels = state
            .channels
            .iter()
            .filter(|c| c.curator_id == curator.curator_id)
            .cloned()
            .collect();
        let campaigns = state
            .campaigns
            .iter()
            .filter(|c| c.curator_id == curator.curator_id)
            .cloned()
            .collect();

        Ok(CuratorHierarchy {
            curator: Some(curator),
            channels,
            campaigns,
        })
    }

    async fn update_curator(
        &self,
        external_user_id: &str,
        fields: &Record<CuratorField>,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.check(GatewayOp::UpdateCurator)?;

        let curator = state
            .curators
            .iter_mut()
            .find(|c| c.external_user_id() == Some(external_user_id))
            .ok_or_else(|| no_rows("playlisters", format!("spotifyuserid={external_user_id}")))?;
        curator.fields = apply(&curator.fields, fields);

        state.writes.push(RecordedWrite::UpdateCurator {
            external_user_id: external_user_id.to_string(),
            fields: fields.clone(),
        });
        Ok(())
    }

    async fn update_channel(
        &self,
        external_channel_id: &str,
        curator_id: i64,
        fields: &Record<ChannelField>,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.check(GatewayOp::UpdateChannel)?;

        let mut touched = 0usize;
        for channel in state.channels.iter_mut().filter(|c| {
            c.curator_id == curator_id && c.external_channel_id() == Some(external_channel_id)
        }) {
            channel.fields = apply(&channel.fields, fields);
            touched += 1;
        }
        if touched == 0 {
            return Err(no_rows(
                "playlists",
                format!("playlistspotifyid={external_channel_id}, playlisterid={curator_id}"),
            ));
        }

        state.writes.push(RecordedWrite::UpdateChannel {
            external_channel_id: external_channel_id.to_string(),
            curator_id,
            fields: fields.clone(),
        });
        Ok(())
    }

    async fn insert_channel(
        &self,
        curator_id: i64,
        fields: &Record<ChannelField>,
    ) -> Result<i64, GatewayError> {
        let mut state = self.state.lock().await;
        state.check(GatewayOp::InsertChannel)?;

        let channel_id = state.next_channel_id;
        state.next_channel_id += 1;
        state.channels.push(StoredChannel {
            channel_id,
            curator_id,
            fields: fields.clone(),
        });
        state.writes.push(RecordedWrite::InsertChannel {
            curator_id,
            channel_id,
            fields: fields.clone(),
        });
        Ok(channel_id)
    }

    async fn update_campaign(
        &self,
        campaign_id: i64,
        channel_id: i64,
        curator_id: i64,
        fields: &Record<CampaignField>,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.check(GatewayOp::UpdateCampaign)?;

        let mut touched = 0usize;
        for campaign in state.campaigns.iter_mut().filter(|c| {
            c.channel_id == channel_id
                && c.curator_id == curator_id
                && c.fields.get(&CampaignField::CampaignId) == Some(&FieldValue::Integer(campaign_id))
        }) {
            campaign.fields = apply(&campaign.fields, fields);
            touched += 1;
        }
        if touched == 0 {
            return Err(no_rows(
                "playlistcampaigns",
                format!("playlistid={channel_id}, campaignid={campaign_id}, playlisterid={curator_id}"),
            ));
        }

        state.writes.push(RecordedWrite::UpdateCampaign {
            campaign_id,
            channel_id,
            curator_id,
            fields: fields.clone(),
        });
        Ok(())
    }

    async fn insert_campaign(
        &self,
        curator_id: i64,
        channel_id: i64,
        fields: &Record<CampaignField>,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.check(GatewayOp::InsertCampaign)?;

        state.campaigns.push(StoredCampaign {
            channel_id,
            curator_id,
            fields: fields.clone(),
        });
        state.writes.push(RecordedWrite::InsertCampaign {
            curator_id,
            channel_id,
            fields: fields.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryGateway {
        let mut fields = Record::new();
        fields.insert(CuratorField::ExternalUserId, FieldValue::from("u1"));
        let mut channel_fields = Record::new();
        channel_fields.insert(ChannelField::ExternalChannelId, FieldValue::from("pl"));
        MemoryGateway::new()
            .with_curator(StoredCurator {
                curator_id: 1,
                fields,
            })
            .with_channel(StoredChannel {
                channel_id: 2000,
                curator_id: 1,
                fields: channel_fields,
            })
    }

    #[tokio::test]
    async fn fetch_scopes_children_to_curator() {
        let gateway = seeded().with_channel(StoredChannel {
            channel_id: 1,
            curator_id: 99,
            fields: Record::new(),
        });
        let hierarchy = gateway.fetch_curator_with_children("u1").await.expect("fetch");
        assert_eq!(hierarchy.curator.map(|c| c.curator_id), Some(1));
        assert_eq!(hierarchy.channels.len(), 1);
        assert!(gateway
            .fetch_curator_with_children("nobody")
            .await
            .expect("fetch")
            .curator
            .is_none());
    }

    #[tokio::test]
    async fn inserted_channels_get_fresh_ids_past_seeded_rows() {
        let gateway = seeded();
        let id = gateway.insert_channel(1, &Record::new()).await.expect("insert");
        assert_eq!(id, 2001);
    }

    #[tokio::test]
    async fn injected_failure_leaves_state_untouched() {
        let gateway = seeded().failing_on(GatewayOp::UpdateCurator);
        let mut fields = Record::new();
        fields.insert(CuratorField::Email, FieldValue::from("a@x.com"));
        let err = gateway.update_curator("u1", &fields).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
        assert!(gateway.writes().await.is_empty());
        let curator = gateway.curator("u1").await.expect("curator");
        assert!(!curator.fields.contains_key(&CuratorField::Email));
    }

    #[tokio::test]
    async fn update_of_missing_row_reports_no_rows() {
        let gateway = seeded();
        let err = gateway
            .update_channel("absent", 1, &Record::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoRowsAffected { table: "playlists", .. }));
    }
}
