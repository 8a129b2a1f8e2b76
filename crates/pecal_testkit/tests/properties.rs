//! Property tests for the offline queue.

use pecal_storage::MemoryStore;
use pecal_sync::{OfflineQueue, QueueConfig, QueueHandlers, SyncError};
use pecal_testkit::generators::mutation_batch_strategy;
use proptest::prelude::*;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn flush_replays_in_order_and_keeps_failures(batch in mutation_batch_strategy(12)) {
        runtime().block_on(async {
            let queue = OfflineQueue::new(
                Arc::new(MemoryStore::new()),
                "queue",
                "queue:abandoned",
                QueueConfig::default(),
            );
            let mut ids = Vec::new();
            let mut failing = std::collections::HashSet::new();
            for (mutation, fails) in &batch {
                let item = queue.enqueue(mutation.clone()).await.unwrap();
                if *fails {
                    failing.insert(item.id);
                }
                ids.push(item.id);
            }

            let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let handlers = pecal_sync::MutationKind::ALL.into_iter().fold(
                QueueHandlers::new(),
                |handlers, kind| {
                    let seen = Arc::clone(&seen);
                    let failing = failing.clone();
                    handlers.on(kind, move |item| {
                        seen.lock().push(item.id);
                        let fails = failing.contains(&item.id);
                        async move {
                            if fails {
                                Err(SyncError::network("offline"))
                            } else {
                                Ok(())
                            }
                        }
                    })
                },
            );

            let report = queue.flush(&handlers).await.unwrap();
            assert_eq!(*seen.lock(), ids);
            assert_eq!(report.processed + report.failed, batch.len());
            assert_eq!(report.failed, failing.len());

            let left = queue.items().await.unwrap();
            let expected: Vec<_> = ids.iter().filter(|id| failing.contains(id)).copied().collect();
            assert_eq!(left.iter().map(|i| i.id).collect::<Vec<_>>(), expected);
            assert!(left.iter().all(|i| i.retry_count == 1));
        });
    }
}
