//! SQLite claim correctness under write contention.
//!
//! Floods the store with concurrent claimers while a background writer holds
//! the write lock in short bursts, then asserts that every job was claimed
//! exactly once and every transition survived.

use dashmap::DashSet;
use rand::random;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use formflow::database::models::{JobDbModel, JobType};
use formflow::database::repositories::{JobRepository, SqlxJobRepository};
use formflow::database::{init_pool_with_size, run_migrations};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "stress test; run explicitly to validate claim correctness under contention"]
async fn claim_stress_no_double_claims_or_lost_transitions() {
    const JOBS: usize = 200;
    const WORKERS: usize = 16;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("stress.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = init_pool_with_size(&db_url, 32).await.unwrap();
    run_migrations(&pool).await.unwrap();

    let repo = Arc::new(SqlxJobRepository::new(pool.clone()));

    // Seed a backlog of immediately-eligible PENDING jobs.
    let eligible_since = chrono::Utc::now() - chrono::Duration::seconds(5);
    for i in 0..JOBS {
        let payload = serde_json::json!({
            "submission_id": format!("sub-{i}"),
            "prompt": "stress",
            "model": "standard",
        });
        let job = JobDbModel::new(JobType::AiGeneration, payload.to_string(), 3, eligible_since);
        repo.create_job(&job).await.unwrap();
    }

    // Background writer that periodically holds the write lock briefly.
    let locker_pool = pool.clone();
    let locker = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            if let Ok(mut tx) = locker_pool.begin().await {
                let _ = sqlx::query(
                    "UPDATE jobs SET updated_at = updated_at WHERE id IN (SELECT id FROM jobs LIMIT 1)",
                )
                .execute(&mut *tx)
                .await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.commit().await;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let claimed_ids = Arc::new(DashSet::<String>::new());

    let mut workers = JoinSet::new();
    for _ in 0..WORKERS {
        let repo = repo.clone();
        let claimed_ids = claimed_ids.clone();
        workers.spawn(async move {
            loop {
                let batch_size = 1 + (random::<u64>() % 3) as usize;
                let batch = repo.claim_next_batch(batch_size, false).await.unwrap();
                if batch.is_empty() {
                    if repo.get_job_counts_by_status().await.unwrap().pending == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }

                for claimed in batch {
                    let inserted = claimed_ids.insert(claimed.id.clone());
                    assert!(inserted, "double-claimed job {}", claimed.id);

                    // A little jitter to increase interleavings.
                    if random::<u8>() % 3 == 0 {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(Duration::from_millis(random::<u64>() % 3)).await;
                    }

                    let owner = claimed.owner_token.as_deref().expect("claimed without owner");
                    repo.mark_completed(&claimed.id, owner, "{}", 0.01)
                        .await
                        .expect("completion transition was lost");
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(30), async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible deadlock)");

    let _ = locker.await;

    assert_eq!(claimed_ids.len(), JOBS, "not all jobs were claimed");

    let counts = repo.get_job_counts_by_status().await.unwrap();
    assert_eq!(counts.pending, 0, "pending jobs remain");
    assert_eq!(counts.processing, 0, "processing jobs remain");
    assert_eq!(counts.completed, JOBS as u64, "not all jobs completed");

    let missing_times: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE started_at IS NULL OR completed_at IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(missing_times, 0, "some jobs missing timestamps");
}
