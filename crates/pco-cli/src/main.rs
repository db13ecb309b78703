use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use pco_core::{CampaignField, ChannelField, CuratorField, IncomingRecord};
use pco_storage::PersistenceGateway;
use pco_sync::{connect_gateway, render_outcome, OutcomeReport, ReconcileConfig, Reconciler};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pco-cli")]
#[command(about = "Playlist curator outreach reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge one outreach record into the curator hierarchy.
    Reconcile(ReconcileArgs),
    /// Print the stored hierarchy of one curator as JSON.
    Inspect {
        #[arg(long = "user-id")]
        user_id: String,
    },
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[arg(long)]
    curator: Option<String>,
    #[arg(long = "user-id")]
    user_id: String,
    #[arg(long = "first-name")]
    first_name: Option<String>,
    #[arg(long = "follow-up-status")]
    follow_up_status: Option<String>,
    #[arg(long)]
    fb: Option<String>,
    #[arg(long = "fb-account")]
    fb_account: Option<String>,
    #[arg(long)]
    ig: Option<String>,
    #[arg(long = "ig-account")]
    ig_account: Option<String>,
    #[arg(long)]
    linkedin: Option<String>,
    /// MM/DD/YYYY
    #[arg(long = "last-contacted", value_parser = parse_us_date)]
    last_contacted: Option<NaiveDate>,
    #[arg(long, default_value = "ENG")]
    language: String,
    #[arg(long)]
    email: Option<String>,
    /// External playlist id; without it only the curator is reconciled.
    #[arg(long = "source-id")]
    source_id: Option<String>,
    #[arg(long)]
    followers: Option<i64>,
    #[arg(long)]
    campaignid: Option<i64>,
    #[arg(long = "playlist-peers")]
    playlist_peers: Option<String>,
    #[arg(long = "placement-status", default_value = "Not yet")]
    placement_status: String,
    #[arg(long = "num-messages", default_value_t = 1)]
    num_messages: i64,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
}

fn parse_us_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%m/%d/%Y")
        .map_err(|err| format!("expected MM/DD/YYYY, got {raw:?}: {err}"))
}

impl ReconcileArgs {
    fn to_record(&self) -> IncomingRecord {
        let curator_fields = [
            (CuratorField::FullName, &self.curator),
            (CuratorField::FirstName, &self.first_name),
            (CuratorField::FollowUpStatus, &self.follow_up_status),
            (CuratorField::Facebook, &self.fb),
            (CuratorField::FacebookContactedBy, &self.fb_account),
            (CuratorField::Instagram, &self.ig),
            (CuratorField::InstagramContactedBy, &self.ig_account),
            (CuratorField::LinkedIn, &self.linkedin),
            (CuratorField::Email, &self.email),
        ];

        let mut record = IncomingRecord::new(self.user_id.clone())
            .with_curator(CuratorField::PreferredLanguage, self.language.as_str());
        for (field, value) in curator_fields {
            if let Some(value) = value {
                record = record.with_curator(field, value.as_str());
            }
        }
        if let Some(date) = self.last_contacted {
            record = record.with_curator(CuratorField::LastContacted, date);
        }

        let Some(source_id) = &self.source_id else {
            return record;
        };
        record = record.with_channel(ChannelField::ExternalChannelId, source_id.as_str());
        if let Some(followers) = self.followers {
            record = record.with_channel(ChannelField::Followers, followers);
        }

        if let Some(campaign_id) = self.campaignid {
            record = record
                .with_campaign(CampaignField::CampaignId, campaign_id)
                .with_campaign(CampaignField::PlacementStatus, self.placement_status.as_str())
                .with_campaign(CampaignField::MessageCount, self.num_messages);
            if let Some(peers) = &self.playlist_peers {
                record = record.with_campaign(CampaignField::ReferenceArtists, peers.as_str());
            }
        }
        record
    }
}

async fn reconcile(args: ReconcileArgs) -> Result<ExitCode> {
    let record = args.to_record();
    let config = ReconcileConfig::from_env();
    let gateway = connect_gateway(&config).await?;
    let reconciler = Reconciler::new().with_duplicate_policy(config.duplicate_policy);

    if args.dry_run {
        return match reconciler.plan(&gateway, &record).await {
            Ok(plan) => {
                println!("{}", serde_json::to_string_pretty(&plan)?);
                Ok(ExitCode::SUCCESS)
            }
            Err(failure) => {
                println!("{}", render_outcome(&Err(failure)));
                Ok(ExitCode::FAILURE)
            }
        };
    }

    let outcome = reconciler.reconcile(&gateway, &record).await;
    if args.json {
        println!("{}", OutcomeReport::from(&outcome).to_json()?);
    } else {
        println!("{}", render_outcome(&outcome));
    }

    Ok(if outcome.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn inspect(user_id: &str) -> Result<ExitCode> {
    let config = ReconcileConfig::from_env();
    let gateway = connect_gateway(&config).await?;
    let hierarchy = gateway
        .fetch_curator_with_children(user_id)
        .await
        .with_context(|| format!("fetching curator {user_id}"))?;
    if hierarchy.curator.is_none() {
        eprintln!("curator {user_id} not found");
        return Ok(ExitCode::FAILURE);
    }
    println!("{}", serde_json::to_string_pretty(&hierarchy)?);
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Reconcile(args) => reconcile(args).await,
        Commands::Inspect { user_id } => inspect(&user_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pco_core::FieldValue;

    fn parse(args: &[&str]) -> ReconcileArgs {
        let mut argv = vec!["pco-cli", "reconcile"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).command {
            Commands::Reconcile(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn last_contacted_uses_month_first_format() {
        assert_eq!(
            parse_us_date("03/09/2024"),
            Ok(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap())
        );
        assert!(parse_us_date("2024-03-09").is_err());
    }

    #[test]
    fn curator_only_invocation_builds_no_children() {
        let record = parse(&["--user-id", "u1", "--email", "a@x.com"]).to_record();
        assert!(record.channel.is_none());
        assert!(record.campaign.is_none());
        assert_eq!(
            record.curator.get(&CuratorField::PreferredLanguage),
            Some(&FieldValue::from("ENG"))
        );
        assert!(!record.curator.contains_key(&CuratorField::FirstName));
        record.validate().expect("valid");
    }

    #[test]
    fn source_id_and_campaign_build_full_record() {
        let record = parse(&[
            "--user-id",
            "u1",
            "--source-id",
            "pl-1",
            "--followers",
            "250",
            "--campaignid",
            "7",
            "--last-contacted",
            "01/05/2024",
        ])
        .to_record();

        record.validate().expect("valid");
        assert_eq!(record.external_channel_id(), Some("pl-1"));
        assert_eq!(record.campaign_id(), Some(7));
        let campaign = record.campaign.as_ref().expect("campaign");
        assert_eq!(
            campaign.get(&CampaignField::PlacementStatus),
            Some(&FieldValue::from("Not yet"))
        );
        assert_eq!(campaign.get(&CampaignField::MessageCount), Some(&FieldValue::Integer(1)));
        assert!(!campaign.contains_key(&CampaignField::ReferenceArtists));
    }

    #[test]
    fn omitted_followers_leave_stored_count_alone() {
        let record = parse(&["--user-id", "u1", "--source-id", "pl-1"]).to_record();
        let channel = record.channel.as_ref().expect("channel");
        assert!(!channel.contains_key(&ChannelField::Followers));

        let record = parse(&["--user-id", "u1", "--source-id", "pl-1", "--followers", "9"])
            .to_record();
        assert_eq!(
            record.channel.as_ref().and_then(|c| c.get(&ChannelField::Followers)),
            Some(&FieldValue::Integer(9))
        );
    }
}
