//! Moderation fan-out: batched report notifications to a chat webhook.
//!
//! Report events are coalesced per reported player for a short window,
//! rendered into an embed payload and POSTed to the configured webhook.
//! Delivery is at-most-once: a failed POST is logged and dropped, which is
//! acceptable because every report is already durably stored before the
//! event reaches this module.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info};
use serde_json::{json, Value};
use shared::messages::ReportType;
use shared::steamid::steamid3;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

/// One successful report request, as handed over by the report handler.
#[derive(Debug, Clone)]
pub struct ReportData {
    pub sender_steamid: u64,
    pub sender_name: String,
    pub receiver_steamid: u64,
    pub receiver_name: String,
    pub types: Vec<ReportType>,
}

#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// Webhook URL; `None` disables the fan-out entirely.
    pub webhook_url: Option<String>,
    /// Role mentioned in the notification content, if any.
    pub moderator_role_id: Option<String>,
    /// How long to keep collecting reports before flushing a batch.
    pub coalesce_window: Duration,
    /// Hard timeout on the webhook POST.
    pub request_timeout: Duration,
}

impl ModerationConfig {
    pub fn new(webhook_url: Option<String>, moderator_role_id: Option<String>) -> Self {
        Self {
            webhook_url,
            moderator_role_id,
            coalesce_window: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn enabled(&self) -> bool {
        self.webhook_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

/// Handle used by the report path; sending never blocks the handler.
#[derive(Clone)]
pub struct ReportNotifier {
    tx: mpsc::UnboundedSender<ReportData>,
}

impl ReportNotifier {
    /// Spawns the fan-out worker and returns its handle.
    pub fn spawn(config: ModerationConfig, shutdown: watch::Receiver<bool>) -> Self {
        if config.enabled() {
            info!("moderation fan-out enabled");
            if config.moderator_role_id.is_some() {
                info!("moderation notifications will mention the moderator role");
            }
        } else {
            info!("moderation fan-out disabled (no webhook URL)");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(config, rx, shutdown));
        Self { tx }
    }

    pub fn enqueue(&self, report: ReportData) {
        // A closed channel just means we are shutting down.
        let _ = self.tx.send(report);
    }
}

async fn worker(
    config: ModerationConfig,
    mut rx: mpsc::UnboundedReceiver<ReportData>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build webhook client: {}", e);
            return;
        }
    };

    loop {
        let first = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
            received = rx.recv() => match received {
                Some(report) => report,
                None => return,
            },
        };

        // Coalesce everything that arrives within the window.
        let mut pending = vec![first];
        let window = sleep(config.coalesce_window);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                received = rx.recv() => match received {
                    Some(report) => pending.push(report),
                    None => break,
                },
            }
        }

        flush(&client, &config, pending).await;
    }
}

/// Groups pending reports by reported player and posts one notification
/// per group.
async fn flush(client: &reqwest::Client, config: &ModerationConfig, pending: Vec<ReportData>) {
    let mut by_receiver: BTreeMap<u64, Vec<ReportData>> = BTreeMap::new();
    for report in pending {
        by_receiver.entry(report.receiver_steamid).or_default().push(report);
    }

    for (receiver, batch) in by_receiver {
        let payload = build_notification(&batch, config.moderator_role_id.as_deref());
        if !config.enabled() {
            debug!(
                "dropping notification for {} ({} report(s), fan-out disabled)",
                receiver,
                batch.len()
            );
            continue;
        }
        let url = config.webhook_url.as_deref().unwrap_or_default();

        match client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("sent moderation notification for {} report(s)", batch.len());
            }
            Ok(response) => {
                error!(
                    "moderation webhook returned status {}",
                    response.status().as_u16()
                );
            }
            Err(e) => {
                error!("moderation webhook failed: {}", e);
            }
        }
    }
}

/// Renders one batch (all for the same reported player) into the webhook
/// embed payload.
fn build_notification(batch: &[ReportData], moderator_role_id: Option<&str>) -> Value {
    let receiver = batch[0].receiver_steamid;
    let receiver_id3 = steamid3(receiver);
    let receiver_label = if batch[0].receiver_name.is_empty() {
        receiver_id3.clone()
    } else {
        format!("{} ({})", receiver_id3, batch[0].receiver_name)
    };

    let mut type_counts: BTreeMap<u8, usize> = BTreeMap::new();
    for report in batch {
        for &kind in &report.types {
            *type_counts.entry(kind.as_u8()).or_default() += 1;
        }
    }
    let summary = type_counts
        .iter()
        .filter_map(|(&kind, &count)| {
            let kind = ReportType::from_u8(kind)?;
            Some(format!("{} {} × {}", kind.emoji(), kind.label(), count))
        })
        .collect::<Vec<_>>()
        .join("\n");

    let total_reports: usize = batch.iter().map(|r| r.types.len()).sum();
    let mut reporters: Vec<u64> = batch.iter().map(|r| r.sender_steamid).collect();
    reporters.sort_unstable();
    reporters.dedup();

    let mut recent_lines: Vec<String> = Vec::new();
    'outer: for report in batch {
        for &kind in &report.types {
            if recent_lines.len() == 5 {
                break 'outer;
            }
            let mut line = format!(
                "{} {} by {}",
                kind.emoji(),
                kind.label(),
                steamid3(report.sender_steamid)
            );
            if !report.sender_name.is_empty() {
                line.push_str(&format!(" ({})", report.sender_name));
            }
            recent_lines.push(line);
        }
    }
    if total_reports > recent_lines.len() {
        recent_lines.push(format!(
            "... and {} more report(s)",
            total_reports - recent_lines.len()
        ));
    }

    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut payload = json!({
        "embeds": [{
            "title": "\u{1F6A8} New Player Report(s)",
            "color": 16728132,
            "fields": [
                {
                    "name": "\u{1F464} Reported Player",
                    "value": format!(
                        "{}\n[Profile](https://steamcommunity.com/profiles/{})",
                        receiver_label, receiver
                    ),
                    "inline": false,
                },
                {
                    "name": "\u{1F4CA} Report Summary",
                    "value": summary,
                    "inline": true,
                },
                {
                    "name": "\u{1F4C8} Statistics",
                    "value": format!(
                        "**Total Reports:** {}\n**Unique Reporters:** {}",
                        total_reports,
                        reporters.len()
                    ),
                    "inline": true,
                },
                {
                    "name": "\u{1F4DD} Recent Reports",
                    "value": recent_lines.join("\n"),
                    "inline": false,
                },
            ],
            "footer": { "text": "Coordinator Report System" },
            "timestamp": timestamp,
        }],
    });

    if let Some(role) = moderator_role_id {
        payload["content"] = Value::String(format!("<@&{}> New player report(s) received!", role));
    }
    payload
}
