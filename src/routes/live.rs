//! WebSocket surface of the fan-out bus.
//!
//! Clients send `subscribe`, `unsubscribe` and `position` frames; the server
//! pushes bus events plus a few control frames. Subscribing to a trip topic
//! always answers with the current trip state first, which is the re-sync
//! point after a reconnect.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthenticatedUser, CurrentUser, Role},
    error::{AppError, TripError},
    models::event::{BusEvent, Position, Topic},
    services::bus::Connection,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(upgrade))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        topic: Topic,
    },
    Unsubscribe {
        topic: Topic,
    },
    Position {
        trip_id: String,
        lat: f64,
        lng: f64,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    Subscribed { topic: Topic },
    Unsubscribed { topic: Topic },
    Error { code: String, message: String },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outgoing {
    Control(ControlFrame),
    Event(BusEvent),
}

async fn upgrade(
    State(state): State<AppState>,
    current: CurrentUser,
    ws: WebSocketUpgrade,
) -> Response {
    let user = current.0;
    ws.on_upgrade(move |socket| serve(state, user, socket))
}

async fn serve(state: AppState, user: AuthenticatedUser, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let connection = state.bus.connect();
    let mut session = Session {
        state: &state,
        user: &user,
        connection: &connection,
        driving: HashMap::new(),
    };
    info!(user = %user.id, role = %user.role, connection = connection.id(), "live connection opened");

    loop {
        let outgoing = tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => session.handle(&text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(connection = connection.id(), error = %err, "live connection errored");
                    break;
                }
            },
            event = connection.recv() => match event {
                Some(event) => {
                    session.observe(&event);
                    vec![Outgoing::Event(event)]
                }
                None => {
                    info!(connection = connection.id(), "bus closed the connection");
                    break;
                }
            },
        };

        for frame in outgoing {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "frame not serializable");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                debug!(connection = connection.id(), "peer went away mid-send");
                return;
            }
        }
    }
    info!(connection = connection.id(), "live connection closed");
}

struct Session<'a> {
    state: &'a AppState,
    user: &'a AuthenticatedUser,
    connection: &'a Connection,
    /// Trips this driver was verified to be driving, and when.
    driving: HashMap<String, Instant>,
}

/// How long a verified trip is trusted before its status is read again.
const DRIVING_RECHECK: Duration = Duration::from_secs(30);

impl Session<'_> {
    async fn handle(&mut self, text: &str) -> Vec<Outgoing> {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                let err = AppError::from(TripError::InvalidInput(err.to_string()));
                return vec![error_frame(&err)];
            }
        };
        let result = match frame {
            ClientFrame::Subscribe { topic } => self.subscribe(topic).await,
            ClientFrame::Unsubscribe { topic } => {
                self.connection.unsubscribe(&topic);
                Ok(vec![Outgoing::Control(ControlFrame::Unsubscribed { topic })])
            }
            ClientFrame::Position {
                trip_id,
                lat,
                lng,
                at,
            } => self.report(trip_id, lat, lng, at).await,
        };
        result.unwrap_or_else(|err| vec![error_frame(&err)])
    }

    async fn subscribe(&mut self, topic: Topic) -> Result<Vec<Outgoing>, AppError> {
        match &topic {
            Topic::Trip(trip_id) => {
                // Register before reading the snapshot so no commit falls
                // between the two.
                self.connection.subscribe(&topic);
                let trip = match self.state.lifecycle.fetch(trip_id).await {
                    Ok(trip) if trip.is_party(&self.user.id) => trip,
                    Ok(_) => {
                        self.connection.unsubscribe(&topic);
                        return Err(TripError::NotAParty.into());
                    }
                    Err(err) => {
                        self.connection.unsubscribe(&topic);
                        return Err(err.into());
                    }
                };
                let mut frames = vec![
                    Outgoing::Control(ControlFrame::Subscribed {
                        topic: topic.clone(),
                    }),
                    Outgoing::Event(BusEvent::trip_changed(&trip)),
                ];
                if let Some(position) = self.state.relay.latest(trip_id) {
                    frames.push(Outgoing::Event(BusEvent::position(trip_id, position)));
                }
                Ok(frames)
            }
            Topic::Marketplace(category) => {
                if self.user.role != Role::Driver {
                    return Err(AppError::Forbidden);
                }
                let eligible = self.state.dispatch.eligible_category(&self.user.id).await?;
                if eligible.as_deref() != Some(category.as_str()) {
                    return Err(TripError::NotClaimable.into());
                }
                if !self.state.store.active_for_driver(&self.user.id).await?.is_empty() {
                    return Err(TripError::DriverBusy.into());
                }
                self.connection.subscribe(&topic);
                Ok(vec![Outgoing::Control(ControlFrame::Subscribed { topic })])
            }
        }
    }

    async fn report(
        &mut self,
        trip_id: String,
        lat: f64,
        lng: f64,
        at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Outgoing>, AppError> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(TripError::InvalidInput("coordinate out of range".into()).into());
        }
        let fresh = self
            .driving
            .get(&trip_id)
            .is_some_and(|verified_at| verified_at.elapsed() < DRIVING_RECHECK);
        if !fresh {
            let trip = self.state.lifecycle.fetch(&trip_id).await?;
            if !trip.is_driver(&self.user.id) || !trip.status.is_active() {
                self.driving.remove(&trip_id);
                return Err(TripError::NotAParty.into());
            }
            self.driving.insert(trip_id.clone(), Instant::now());
        }
        let position = Position {
            lat,
            lng,
            at: at.unwrap_or_else(Utc::now),
        };
        self.state.relay.report(&trip_id, position);
        Ok(Vec::new())
    }

    /// Stops relaying for trips that just ended.
    fn observe(&mut self, event: &BusEvent) {
        if let BusEvent::TripChanged {
            trip_id, status, ..
        } = event
        {
            if status.is_terminal() {
                self.driving.remove(trip_id);
            }
        }
    }
}

fn error_frame(err: &AppError) -> Outgoing {
    Outgoing::Control(ControlFrame::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::AppConfig,
        db::{init_pool, migrate},
        models::{
            driver::DriverProfile,
            trip::{fixtures, Trip, TripStatus},
        },
        services::{settlement::OutboxLedger, verification::SqliteDriverDirectory},
        state::AppState,
    };

    struct Fixture {
        state: AppState,
        drivers: SqliteDriverDirectory,
        _root: TempDir,
    }

    async fn fixture() -> Fixture {
        let root = TempDir::new().expect("temp dir");
        let database_url = format!(
            "sqlite://{}",
            root.path().join("live.sqlite").to_string_lossy()
        );
        let config = AppConfig {
            database_url: database_url.clone(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            db_max_connections: 4,
            status_queue_capacity: 16,
            settlement_retry_interval: Duration::from_secs(30),
            settlement_grace: Duration::from_secs(60),
        };
        let db = init_pool(&database_url, 4).await.expect("pool");
        migrate(&db).await.expect("migrate");
        let drivers = SqliteDriverDirectory::new(db.clone());
        let ledger = Arc::new(OutboxLedger::new(db.clone()));
        let (state, _fanout) = AppState::start(config, db, Arc::new(drivers.clone()), ledger);
        Fixture {
            state,
            drivers,
            _root: root,
        }
    }

    impl Fixture {
        async fn driver(&self, driver_id: &str, category: &str) {
            let profile = DriverProfile {
                driver_id: driver_id.into(),
                active_category: Some(category.into()),
                available: true,
                verified: true,
            };
            self.drivers.upsert(&profile).await.expect("driver");
        }

        async fn claimed_trip(&self, driver_id: &str) -> Trip {
            self.driver(driver_id, "van").await;
            let trip = self
                .state
                .lifecycle
                .create("client-1", fixtures::new_trip("van"))
                .await
                .expect("trip");
            self.state
                .dispatch
                .claim(&trip.id, driver_id)
                .await
                .expect("claim")
        }

        fn session<'a>(&'a self, user: &'a AuthenticatedUser, connection: &'a Connection) -> Session<'a> {
            Session {
                state: &self.state,
                user,
                connection,
                driving: HashMap::new(),
            }
        }
    }

    fn user(id: &str, role: Role) -> AuthenticatedUser {
        AuthenticatedUser {
            id: id.into(),
            role,
        }
    }

    async fn send(session: &mut Session<'_>, frame: Value) -> Vec<Value> {
        session
            .handle(&frame.to_string())
            .await
            .iter()
            .map(|outgoing| serde_json::to_value(outgoing).expect("frame"))
            .collect()
    }

    #[tokio::test]
    async fn trip_subscription_answers_with_a_snapshot() {
        let fx = fixture().await;
        let trip = fx.claimed_trip("d1").await;
        let at = Utc::now();
        fx.state.relay.report(
            &trip.id,
            Position {
                lat: 52.5,
                lng: 13.4,
                at,
            },
        );

        let client = user("client-1", Role::Client);
        let connection = fx.state.bus.connect();
        let mut session = fx.session(&client, &connection);
        let frames = send(
            &mut session,
            json!({ "op": "subscribe", "topic": format!("trip:{}", trip.id) }),
        )
        .await;

        assert_eq!(frames.len(), 3, "{frames:?}");
        assert_eq!(frames[0]["type"], "subscribed");
        assert_eq!(frames[1]["type"], "trip_changed");
        assert_eq!(frames[1]["status"], "accepted");
        assert_eq!(frames[2]["type"], "driver_position");
        assert_eq!(fx.state.bus.subscriber_count(&Topic::trip(&trip.id)), 1);
    }

    #[tokio::test]
    async fn refused_trip_subscriptions_leave_nothing_registered() {
        let fx = fixture().await;
        let trip = fx.claimed_trip("d1").await;
        let stranger = user("someone-else", Role::Client);
        let connection = fx.state.bus.connect();
        let mut session = fx.session(&stranger, &connection);

        let frames = send(
            &mut session,
            json!({ "op": "subscribe", "topic": format!("trip:{}", trip.id) }),
        )
        .await;
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["code"], "not_a_party");
        assert_eq!(fx.state.bus.subscriber_count(&Topic::trip(&trip.id)), 0);

        let frames = send(&mut session, json!({ "op": "subscribe", "topic": "trip:missing" })).await;
        assert_eq!(frames[0]["code"], "trip_not_found");
        assert_eq!(fx.state.bus.subscriber_count(&Topic::trip("missing")), 0);

        let frames = send(&mut session, json!({ "op": "teleport" })).await;
        assert_eq!(frames[0]["code"], "invalid_input");
    }

    #[tokio::test]
    async fn marketplace_is_for_idle_drivers_of_that_category() {
        let fx = fixture().await;
        fx.claimed_trip("busy").await;
        fx.driver("idle", "van").await;
        let topic = json!({ "op": "subscribe", "topic": "marketplace:van" });

        let busy = user("busy", Role::Driver);
        let connection = fx.state.bus.connect();
        let frames = send(&mut fx.session(&busy, &connection), topic.clone()).await;
        assert_eq!(frames[0]["code"], "driver_busy");

        let idle = user("idle", Role::Driver);
        let connection = fx.state.bus.connect();
        let mut session = fx.session(&idle, &connection);
        assert_eq!(send(&mut session, topic.clone()).await[0]["type"], "subscribed");
        let frames = send(&mut session, json!({ "op": "subscribe", "topic": "marketplace:truck" })).await;
        assert_eq!(frames[0]["code"], "not_claimable");

        let client = user("client-1", Role::Client);
        let connection = fx.state.bus.connect();
        let frames = send(&mut fx.session(&client, &connection), topic).await;
        assert_eq!(frames[0]["code"], "forbidden");
        assert_eq!(fx.state.bus.subscriber_count(&Topic::marketplace("van")), 1);
    }

    #[tokio::test]
    async fn only_the_assigned_driver_relays_while_the_trip_runs() {
        let fx = fixture().await;
        let trip = fx.claimed_trip("d1").await;
        let position = |lat: f64| json!({ "op": "position", "trip_id": trip.id, "lat": lat, "lng": 13.4 });

        let other = user("d2", Role::Driver);
        let connection = fx.state.bus.connect();
        let frames = send(&mut fx.session(&other, &connection), position(52.1)).await;
        assert_eq!(frames[0]["code"], "not_a_party");
        assert_eq!(fx.state.relay.latest(&trip.id), None);

        let driver = user("d1", Role::Driver);
        let connection = fx.state.bus.connect();
        let mut session = fx.session(&driver, &connection);
        assert!(send(&mut session, position(52.2)).await.is_empty());
        assert_eq!(fx.state.relay.latest(&trip.id).map(|p| p.lat), Some(52.2));

        fx.state
            .lifecycle
            .transition(&trip.id, "client-1", TripStatus::Cancelled)
            .await
            .expect("cancel");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Still trusted from the cache, but the relay has closed the trip.
        assert!(send(&mut session, position(52.3)).await.is_empty());
        assert_eq!(fx.state.relay.latest(&trip.id), None);

        let stale = Instant::now()
            .checked_sub(DRIVING_RECHECK)
            .expect("monotonic clock past the recheck window");
        session.driving.insert(trip.id.clone(), stale);
        let frames = send(&mut session, position(52.4)).await;
        assert_eq!(frames[0]["code"], "not_a_party");
        assert!(!session.driving.contains_key(&trip.id));
    }
}
