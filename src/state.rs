use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{
    config::AppConfig,
    db::DbPool,
    services::{
        bus::EventBus,
        dispatch::DispatchEngine,
        lifecycle::LifecycleController,
        location::LocationRelay,
        settlement::{Ledger, SettlementHook},
        store::{ChangeFeed, TripStore},
        verification::DriverDirectory,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub store: TripStore,
    pub drivers: Arc<dyn DriverDirectory>,
    pub dispatch: DispatchEngine,
    pub lifecycle: LifecycleController,
    pub settlement: SettlementHook,
    pub bus: EventBus,
    pub relay: LocationRelay,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: DbPool,
        drivers: Arc<dyn DriverDirectory>,
        ledger: Arc<dyn Ledger>,
    ) -> (Self, ChangeFeed) {
        let (store, feed) = TripStore::new(db.clone());
        let settlement = SettlementHook::new(db.clone(), ledger, config.settlement_grace);
        let dispatch = DispatchEngine::new(store.clone(), drivers.clone());
        let lifecycle = LifecycleController::new(store.clone(), settlement.clone());
        let bus = EventBus::new(config.status_queue_capacity);
        let relay = LocationRelay::new(bus.clone());
        let state = Self {
            config,
            db,
            store,
            drivers,
            dispatch,
            lifecycle,
            settlement,
            bus,
            relay,
        };
        (state, feed)
    }

    /// Builds the state and starts draining its change feed into the bus.
    pub fn start(
        config: AppConfig,
        db: DbPool,
        drivers: Arc<dyn DriverDirectory>,
        ledger: Arc<dyn Ledger>,
    ) -> (Self, JoinHandle<()>) {
        let (state, feed) = Self::new(config, db, drivers, ledger);
        let fanout = state
            .bus
            .clone()
            .spawn(feed, state.store.clone(), state.relay.clone());
        (state, fanout)
    }
}
