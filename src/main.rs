use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use arbiter_signal_rs::config::Settings;
use arbiter_signal_rs::consumer::start_signal_consumer;
use arbiter_signal_rs::context::EngineContext;
use arbiter_signal_rs::decision::Decision;
use arbiter_signal_rs::directory::ExchangeDirectory;
use arbiter_signal_rs::persistence::balance_store::RedbBalanceStore;
use arbiter_signal_rs::persistence::event_log::RedbEventLog;
use arbiter_signal_rs::persistence::redb_store::RedbStore;
use arbiter_signal_rs::persistence::reference::{RedbReferenceStore, ReferenceSeed};
use arbiter_signal_rs::persistence::signal_store::RedbSignalStore;
use arbiter_signal_rs::pipeline::SignalPipeline;
use arbiter_signal_rs::reservation::BalanceReservation;
use arbiter_signal_rs::validators::integrity::OrdersIntegrity;
use arbiter_signal_rs::validators::market::MarketRules;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║                 ARBITER SIGNAL RS                             ║");
    info!("║          Signal Validation & Reservation Engine               ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    dotenv::dotenv().ok();

    let settings = Settings::new()?;
    let engine = EngineContext::new_system();

    // --- Persistence ---
    let store = Arc::new(RedbStore::new(&settings.store.path)?);
    let signals = Arc::new(RedbSignalStore::new(store.clone()));
    let balances = Arc::new(RedbBalanceStore::new(store.clone()));
    let events = Arc::new(RedbEventLog::new(store.clone(), engine.time.clone()));
    let reference = Arc::new(RedbReferenceStore::new(store.clone()));

    if let Some(seed_path) = &settings.reference.seed_path {
        let seed = ReferenceSeed::load(seed_path)?;
        seed.apply(reference.as_ref(), balances.as_ref())?;
    }

    let directory = Arc::new(ExchangeDirectory::new(reference.clone()));

    // --- Pipeline wiring ---
    let pipeline = Arc::new(SignalPipeline::new(
        engine.clone(),
        signals.clone(),
        events.clone(),
        OrdersIntegrity::new(directory.clone()),
        MarketRules::new(directory.clone()),
        BalanceReservation::new(balances.clone()),
        Decision::new(signals, events),
    ));

    info!("✅ Core components initialized");

    // --- NATS ---
    info!("connecting to NATS at {}", settings.nats.url);
    let client = match async_nats::connect(&settings.nats.url).await {
        Ok(c) => {
            info!("✅ connected to NATS");
            c
        }
        Err(e) => {
            error!("❌ failed to connect to NATS: {}", e);
            std::process::exit(1);
        }
    };

    let consumer_handle = start_signal_consumer(client, settings.nats.clone(), pipeline).await?;

    consumer_handle.await?;
    Ok(())
}
