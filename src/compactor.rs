use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL once it has grown by at least `threshold` appends.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends since last compaction, below {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task: periodically rewrite a tenant's WAL as a snapshot.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("allocd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();
        let user = Ulid::new();
        engine.register_user(user, "admin").await.unwrap();

        assert!(!compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 1);

        for i in 0..3 {
            let id = Ulid::new();
            engine
                .create_event(id, user, &format!("Temp{i}"), 0, 1000, None)
                .await
                .unwrap();
            engine.delete_event(id, user).await.unwrap();
        }
        assert!(compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let engine = Engine::new(path).unwrap();
        assert_eq!(engine.list_users().await.len(), 1);
        assert!(engine.list_events(None).await.is_empty());
    }
}
