//! Bidirectional LINE ⇄ Discord message id mapping with a JSON snapshot.
//!
//! Two indices are kept, one keyed by LINE ids and one keyed by Discord ids,
//! so a reply on either platform resolves with a single map read. The whole
//! document is rewritten on every mutation (temp file + rename).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::CorrelationConfig;
use crate::error::CorrelationError;
use crate::message::{Direction, Platform, truncate_chars};
use crate::snapshot::write_replacing;

/// Context recorded alongside a new correlation.
#[derive(Debug, Clone, Default)]
pub struct CorrelationMeta {
    /// Author of the source message.
    pub source_user_id: String,
    /// LINE source id or Discord channel id the source message came from.
    pub channel_id: String,
    /// Message content; truncated before it is stored.
    pub content: String,
}

/// A stored link between a source message and its forwarded copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCorrelation {
    pub source_id: String,
    pub target_id: String,
    pub source_platform: Platform,
    pub source_user_id: String,
    pub channel_id: String,
    pub content_snapshot: String,
    pub created_at: DateTime<Utc>,
}

impl MessageCorrelation {
    /// The id on the other side of the link from `id`.
    pub fn counterpart_of(&self, id: &str) -> Option<&str> {
        if self.source_id == id {
            Some(&self.target_id)
        } else if self.target_id == id {
            Some(&self.source_id)
        } else {
            None
        }
    }

    fn same_link(&self, other: &MessageCorrelation) -> bool {
        self.source_id == other.source_id && self.target_id == other.target_id
    }
}

/// On-disk document.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    line_to_discord: HashMap<String, MessageCorrelation>,
    #[serde(default)]
    discord_to_line: HashMap<String, MessageCorrelation>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRef<'a> {
    line_to_discord: &'a HashMap<String, MessageCorrelation>,
    discord_to_line: &'a HashMap<String, MessageCorrelation>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Indices {
    line_to_discord: HashMap<String, MessageCorrelation>,
    discord_to_line: HashMap<String, MessageCorrelation>,
}

impl Indices {
    fn index(&self, direction: Direction) -> &HashMap<String, MessageCorrelation> {
        match direction {
            Direction::LineToDiscord => &self.line_to_discord,
            Direction::DiscordToLine => &self.discord_to_line,
        }
    }

    fn index_mut(&mut self, direction: Direction) -> &mut HashMap<String, MessageCorrelation> {
        match direction {
            Direction::LineToDiscord => &mut self.line_to_discord,
            Direction::DiscordToLine => &mut self.discord_to_line,
        }
    }
}

/// Bidirectional message id store with best-effort file persistence.
pub struct CorrelationStore {
    indices: RwLock<Indices>,
    /// Snapshot location; `None` keeps everything in memory.
    path: Option<PathBuf>,
    snapshot_chars: usize,
}

impl CorrelationStore {
    /// Create an empty store that never touches disk.
    pub fn in_memory(snapshot_chars: usize) -> Arc<Self> {
        Arc::new(Self {
            indices: RwLock::new(Indices::default()),
            path: None,
            snapshot_chars,
        })
    }

    /// Load the store from its snapshot file.
    ///
    /// A missing file starts an empty store. So does an unreadable or corrupt
    /// one, after logging; the next mutation overwrites it.
    pub async fn load(config: &CorrelationConfig) -> Arc<Self> {
        let indices = match read_snapshot(&config.path).await {
            Ok(Some(snapshot)) => {
                info!(
                    path = %config.path.display(),
                    line_to_discord = snapshot.line_to_discord.len(),
                    discord_to_line = snapshot.discord_to_line.len(),
                    last_updated = ?snapshot.last_updated,
                    "Loaded message correlations"
                );
                Indices {
                    line_to_discord: snapshot.line_to_discord,
                    discord_to_line: snapshot.discord_to_line,
                }
            }
            Ok(None) => {
                info!(path = %config.path.display(), "No correlation snapshot, starting empty");
                Indices::default()
            }
            Err(e) => {
                warn!(
                    path = %config.path.display(),
                    error = %e,
                    "Correlation snapshot unreadable, starting empty"
                );
                Indices::default()
            }
        };

        Arc::new(Self {
            indices: RwLock::new(indices),
            path: Some(config.path.clone()),
            snapshot_chars: config.snapshot_chars,
        })
    }

    /// Record that `source_id` on `origin` was forwarded as `target_id`.
    ///
    /// Both directional entries are (over)written. On a persistence failure
    /// the in-memory entries stay valid and the error is returned.
    pub async fn create(
        &self,
        origin: Platform,
        source_id: &str,
        target_id: &str,
        meta: CorrelationMeta,
    ) -> Result<MessageCorrelation, CorrelationError> {
        self.create_at(origin, source_id, target_id, meta, Utc::now())
            .await
    }

    async fn create_at(
        &self,
        origin: Platform,
        source_id: &str,
        target_id: &str,
        meta: CorrelationMeta,
        created_at: DateTime<Utc>,
    ) -> Result<MessageCorrelation, CorrelationError> {
        let correlation = MessageCorrelation {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            source_platform: origin,
            source_user_id: meta.source_user_id,
            channel_id: meta.channel_id,
            content_snapshot: truncate_chars(&meta.content, self.snapshot_chars),
            created_at,
        };

        let source_direction = Direction::keyed_by(origin);
        let mut indices = self.indices.write().await;
        let previous = indices
            .index_mut(source_direction)
            .insert(source_id.to_string(), correlation.clone());
        // A re-targeted source must not stay reachable from its old counterpart.
        if let Some(previous) = previous {
            if let Some(old_target) = previous.counterpart_of(source_id).filter(|t| *t != target_id) {
                let reverse = indices.index_mut(source_direction.reverse());
                if reverse.get(old_target).is_some_and(|c| c.same_link(&previous)) {
                    reverse.remove(old_target);
                }
            }
        }
        indices
            .index_mut(source_direction.reverse())
            .insert(target_id.to_string(), correlation.clone());

        debug!(
            origin = %origin,
            source_id,
            target_id,
            "Correlation created"
        );

        self.persist(&indices).await?;
        Ok(correlation)
    }

    /// Counterpart id for `id` in the given direction.
    pub async fn lookup(&self, id: &str, direction: Direction) -> Option<String> {
        let indices = self.indices.read().await;
        indices
            .index(direction)
            .get(id)
            .and_then(|c| c.counterpart_of(id))
            .map(str::to_string)
    }

    /// Full correlation record for `id` in the given direction.
    pub async fn get(&self, id: &str, direction: Direction) -> Option<MessageCorrelation> {
        self.indices.read().await.index(direction).get(id).cloned()
    }

    /// Remove the correlation keyed by `id`, and its paired entry.
    pub async fn remove(&self, id: &str, direction: Direction) -> Result<bool, CorrelationError> {
        let mut indices = self.indices.write().await;
        let Some(removed) = indices.index_mut(direction).remove(id) else {
            return Ok(false);
        };

        if let Some(other_id) = removed.counterpart_of(id) {
            let other = indices.index_mut(direction.reverse());
            if other.get(other_id).is_some_and(|c| c.same_link(&removed)) {
                other.remove(other_id);
            }
        }

        self.persist(&indices).await?;
        Ok(true)
    }

    /// Remove correlations older than `max_age_days`. Returns how many links
    /// were removed.
    pub async fn sweep_expired(&self, max_age_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let mut guard = self.indices.write().await;
        let indices = &mut *guard;

        let mut removed: HashSet<(String, String)> = HashSet::new();
        for index in [&mut indices.line_to_discord, &mut indices.discord_to_line] {
            index.retain(|_, c| {
                if c.created_at < cutoff {
                    removed.insert((c.source_id.clone(), c.target_id.clone()));
                    false
                } else {
                    true
                }
            });
        }

        if !removed.is_empty() {
            info!(count = removed.len(), max_age_days, "Swept expired correlations");
            if let Err(e) = self.persist(&indices).await {
                warn!(error = %e, "Failed to persist correlations after sweep");
            }
        }

        removed.len()
    }

    /// Number of entries in each index: `(line_to_discord, discord_to_line)`.
    pub async fn len(&self) -> (usize, usize) {
        let indices = self.indices.read().await;
        (indices.line_to_discord.len(), indices.discord_to_line.len())
    }

    pub async fn is_empty(&self) -> bool {
        let indices = self.indices.read().await;
        indices.line_to_discord.is_empty() && indices.discord_to_line.is_empty()
    }

    /// Write the whole document. Called with the write lock held so snapshots
    /// land on disk in mutation order.
    async fn persist(&self, indices: &Indices) -> Result<(), CorrelationError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let body = serde_json::to_vec_pretty(&SnapshotRef {
            line_to_discord: &indices.line_to_discord,
            discord_to_line: &indices.discord_to_line,
            last_updated: Utc::now(),
        })?;

        write_replacing(path, &body)
            .await
            .map_err(|source| CorrelationError::Persistence {
                path: path.display().to_string(),
                source,
            })
    }
}

async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, CorrelationError> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CorrelationError::Persistence {
                path: path.display().to_string(),
                source,
            });
        }
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Spawn a background task that periodically sweeps expired correlations.
pub fn spawn_sweep_task(
    store: Arc<CorrelationStore>,
    interval: Duration,
    max_age_days: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            store.sweep_expired(max_age_days).await;
        }
    })
}
