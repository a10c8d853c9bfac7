use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that compacts the WAL once enough appends have piled up
/// since the last compaction. Keeps restart replay time bounded for
/// long-running deployments with heavy slot churn.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => tracing::error!(error = %e, "WAL compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SemesterRef;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compaction_resets_append_counter() {
        let path = test_wal_path("counter_reset.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let advisor = Ulid::new();
        let sid = engine
            .create_semester(advisor, "Fall".into(), 0, 100 * 86_400)
            .await
            .unwrap();

        // Churn: create and delete slots so the WAL grows past the state.
        for i in 0..10 {
            let slot = engine
                .create_time_slot(advisor, SemesterRef::Id(sid), i * 900)
                .await
                .unwrap();
            engine.delete_time_slot(advisor, slot).await.unwrap();
        }

        assert!(engine.wal_appends_since_compact().await >= 21);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
