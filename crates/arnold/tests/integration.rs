use std::{sync::Arc, sync::Once, time::Duration};

use arnold::{
    config::Config,
    engine::{Engine, EngineBuilder, EngineMsg, EngineReport, ProxyRole, SchedulerKind},
    error::Error,
    peer::{PeerId, RankingPolicy},
    personality::PersonalityKind,
    store::MemoryStore,
    transport::LocalPool,
};
use tokio::{task::JoinHandle, time::timeout};

type EngineTask = JoinHandle<Result<EngineReport, Error>>;

const PIECES: usize = 12;

fn setup_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .compact()
            .with_file(false)
            .without_time()
            .with_test_writer()
            .init();
    });
}

/// Small pieces and short timers, so a whole download takes a blink.
fn config() -> Arc<Config> {
    Arc::new(Config {
        chunk_size: 64,
        chunks_per_piece: 4,
        maximal_engine_sleep_ms: 50,
        transmitter_retry_ms: 10,
        slot_update_interval_ms: 200,
        transfer_monitor_window_ms: 100,
        ..Config::default()
    })
}

fn id(n: u8) -> PeerId {
    PeerId::from([n; 20])
}

async fn join(
    pool: &LocalPool,
    builder: &EngineBuilder,
    peer: PeerId,
    store: MemoryStore,
) -> Engine {
    let membership = pool.join(peer).await.unwrap();
    builder.build(membership, Box::new(store))
}

/// Every member joins before the first engine runs, so that no seeder
/// finds itself alone and leaves.
fn start(engines: Vec<Engine>) -> Vec<EngineTask> {
    engines.into_iter().map(|e| tokio::spawn(e.run())).collect()
}

fn seeder(config: &Arc<Config>) -> EngineBuilder {
    EngineBuilder::new(config.clone()).personality(PersonalityKind::Altruistic)
}

fn seeder_store(config: &Config) -> MemoryStore {
    MemoryStore::seeder(PIECES * config.piece_size(), config.piece_size())
}

fn leecher_store(config: &Config) -> MemoryStore {
    MemoryStore::leecher(PIECES * config.piece_size(), config.piece_size())
}

async fn finish(task: EngineTask) -> EngineReport {
    timeout(Duration::from_secs(60), task)
        .await
        .expect("engine did not stop in time")
        .unwrap()
        .unwrap()
}

// A seeder and a few greedy leechers. Every leecher must end with the whole
// file, which the store only accepts when every piece matches its digest.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leechers_get_the_whole_file() {
    setup_logging();
    let config = config();
    let pool = LocalPool::new(config.received_queue_capacity);
    let builder = EngineBuilder::new(config.clone());

    let seeder = join(&pool, &seeder(&config), id(1), seeder_store(&config)).await;
    let mut leechers = Vec::new();
    for n in 2..5u8 {
        let builder = builder.clone().seed(n as u64);
        leechers.push(join(&pool, &builder, id(n), leecher_store(&config)).await);
    }
    let seeder = tokio::spawn(seeder.run());

    for leecher in start(leechers) {
        let report = finish(leecher).await;
        assert!(report.is_complete(), "{report}");
        assert!(report.download_time.is_some());
    }
    pool.terminate().await;

    let report = finish(seeder).await;
    assert!(report.is_complete());
    assert!(report.transmitter.bytes > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slotted_credit_swarm_completes() {
    setup_logging();
    let config = config();
    let pool = LocalPool::new(config.received_queue_capacity);
    let builder = EngineBuilder::new(config.clone())
        .scheduler(SchedulerKind::Slotted)
        .policy(RankingPolicy::Credit);
    let seeder_builder = builder.clone().personality(PersonalityKind::Altruistic);

    let mut tasks = start(vec![
        join(&pool, &seeder_builder, id(1), seeder_store(&config)).await,
        join(&pool, &builder, id(2), leecher_store(&config)).await,
        join(&pool, &builder, id(3), leecher_store(&config)).await,
    ]);
    let seeder = tasks.remove(0);

    for leecher in tasks {
        let report = finish(leecher).await;
        assert!(report.is_complete(), "{report}");
        assert_eq!(report.scheduler, "Slotted");
    }
    pool.terminate().await;
    finish(seeder).await;
}

// One of the two seeders corrupts every piece it sends. The leecher must
// throw those pieces away and still finish through the honest seeder.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupted_pieces_are_not_kept() {
    setup_logging();
    let config = config();
    let pool = LocalPool::new(config.received_queue_capacity);
    let builder = EngineBuilder::new(config.clone());

    pool.corrupt_pieces_from(id(1)).await;
    let mut tasks = start(vec![
        join(&pool, &builder, id(3), leecher_store(&config)).await,
        join(&pool, &seeder(&config), id(1), seeder_store(&config)).await,
        join(&pool, &seeder(&config), id(2), seeder_store(&config)).await,
    ]);

    let report = finish(tasks.remove(0)).await;
    assert!(report.is_complete(), "{report}");
    pool.terminate().await;
    for seeder in tasks {
        finish(seeder).await;
    }
}

// Sends to the leecher fail a few times before the link comes back.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_sends_are_retried() {
    setup_logging();
    let config = config();
    let pool = LocalPool::new(config.received_queue_capacity);
    let builder = EngineBuilder::new(config.clone());

    pool.fail_sends_to(id(2), 3).await;
    let mut tasks = start(vec![
        join(&pool, &seeder(&config), id(1), seeder_store(&config)).await,
        join(&pool, &builder, id(2), leecher_store(&config)).await,
    ]);

    assert!(finish(tasks.remove(1)).await.is_complete());
    pool.terminate().await;
    let report = finish(tasks.remove(0)).await;
    // later failures are possible once the leecher is gone
    assert!(report.transmitter.retries >= 3, "{report}");
}

// Nothing sent to the first seeder ever arrives. The leecher gives up on it,
// the pool drops it, and the pieces asked from it come from the other one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_seeder_is_dropped() {
    setup_logging();
    let config = config();
    let pool = LocalPool::new(config.received_queue_capacity);
    let builder = EngineBuilder::new(config.clone());

    pool.fail_sends_to(id(1), u32::MAX).await;
    let mut tasks = start(vec![
        join(&pool, &builder, id(3), leecher_store(&config)).await,
        join(&pool, &seeder(&config), id(1), seeder_store(&config)).await,
        join(&pool, &seeder(&config), id(2), seeder_store(&config)).await,
    ]);

    let report = finish(tasks.remove(0)).await;
    assert!(report.is_complete(), "{report}");
    // the dropped seeder stops by itself
    finish(tasks.remove(0)).await;
    assert!(pool.is_suspect(&id(1)).await);
    assert!(!pool.members().await.contains(&id(1)));

    pool.terminate().await;
    finish(tasks.remove(0)).await;
}

// A coordinator that only downloads through its helpers.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coordinator_downloads_through_helpers() {
    setup_logging();
    let config = config();
    let pool = LocalPool::new(config.received_queue_capacity);
    let builder = EngineBuilder::new(config.clone());
    let helper = builder.clone().proxy(Some(ProxyRole::Helper));
    let coordinator = builder.clone().proxy(Some(ProxyRole::Coordinator));

    let mut tasks = start(vec![
        join(&pool, &coordinator, id(4), leecher_store(&config)).await,
        join(&pool, &seeder(&config), id(1), seeder_store(&config)).await,
        join(&pool, &helper, id(2), leecher_store(&config)).await,
        join(&pool, &helper, id(3), leecher_store(&config)).await,
    ]);

    let report = finish(tasks.remove(0)).await;
    assert!(report.is_complete(), "{report}");
    assert!(report.scheduler.starts_with("ProxyCoordinator("));
    pool.terminate().await;

    let seeder = tasks.remove(0);
    for helper in tasks {
        assert_eq!(finish(helper).await.personality, "ProxyHelper");
    }
    finish(seeder).await;
}

#[tokio::test]
async fn quit_stops_an_idle_engine() {
    setup_logging();
    let config = config();
    let pool = LocalPool::new(config.received_queue_capacity);
    let engine = join(
        &pool,
        &EngineBuilder::new(config.clone()),
        id(1),
        leecher_store(&config),
    )
    .await;
    let handle = engine.handle();
    let task = tokio::spawn(engine.run());

    handle.send(EngineMsg::Quit).unwrap();
    let report = finish(task).await;
    assert_eq!(report.pieces, 0);
    assert_eq!(report.received.total(), 0);
    assert!(pool.members().await.is_empty());
}
