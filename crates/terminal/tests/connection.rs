//! Integration tests: ConnectionRegistry -> StreamingConnection -> PacketRouter
//! against an in-process streaming server that answers synchronize requests with a
//! scripted synchronization pass.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use termsync_cache::{HashCacheConfig, StaticIgnoredFieldsProvider, TerminalHashManager};
use termsync_core::{AccountType, InstanceIndex};
use termsync_gateway::{
    ChannelServer, ChannelTransport, PacketRouter, RouterConfig, ServerSender, ThrottlerConfig,
};
use termsync_ports::{ListenerResult, SynchronizationListener};
use termsync_terminal::{
    ConnectionConfig, ConnectionRegistry, ConnectionStatus, TerminalError,
};

const ACCOUNT: &str = "accountId";
const HOST: &str = "ps-mpa-0";

fn packet(request: &Value, packet_type: &str, body: Value) -> Value {
    let mut packet = json!({
        "type": packet_type,
        "accountId": request["accountId"],
        "instanceIndex": request["instanceIndex"],
        "host": HOST,
        "synchronizationId": request["synchronizationId"],
    });
    if let (Some(packet), Some(body)) = (packet.as_object_mut(), body.as_object()) {
        packet.extend(body.clone());
    }
    packet
}

/// Data sets the client offered hashes for are reported unchanged and not resent
fn synchronization_pass(request: &Value) -> Vec<Value> {
    let offered = |name: &str| {
        request[name]
            .as_array()
            .is_some_and(|hashes| !hashes.is_empty())
    };
    let mut started = json!({});
    let mut packets = Vec::new();
    packets.push(packet(
        request,
        "accountInformation",
        json!({"accountInformation": {
            "platform": "mt5",
            "broker": "Raw Trading Ltd",
            "currency": "USD",
            "server": "ICMarketsSC-Demo",
            "balance": 7319.9,
            "equity": 7306.65,
            "leverage": 100
        }}),
    ));
    if offered("specificationsHashes") {
        started["specificationsHashIndex"] = json!(0);
    } else {
        packets.push(packet(
            request,
            "specifications",
            json!({"specifications": [{"symbol": "EURUSD", "tickSize": 0.00001, "digits": 5}]}),
        ));
    }
    if offered("positionsHashes") {
        started["positionsHashIndex"] = json!(0);
    } else {
        packets.push(packet(
            request,
            "positions",
            json!({"positions": [{
                "id": "1",
                "type": "POSITION_TYPE_BUY",
                "symbol": "EURUSD",
                "openPrice": 1.26101,
                "volume": 0.07,
                "profit": -85.25
            }]}),
        ));
    }
    if offered("ordersHashes") {
        started["ordersHashIndex"] = json!(0);
    } else {
        packets.push(packet(request, "orders", json!({"orders": []})));
    }
    packets.push(packet(
        request,
        "deals",
        json!({"deals": [{"id": "33", "type": "DEAL_TYPE_BUY", "time": "2026-01-05T10:00:00Z"}]}),
    ));
    packets.push(packet(request, "orderSynchronizationFinished", json!({})));
    packets.push(packet(request, "dealSynchronizationFinished", json!({})));

    packets.insert(0, packet(request, "synchronizationStarted", started));
    packets
}

/// Answers every request. Synchronize requests get their pass right away unless
/// passes are held, in which case only the response is sent.
struct FakeServer {
    requests: Arc<Mutex<Vec<Value>>>,
    senders: Arc<Mutex<Vec<ServerSender>>>,
    hold: Arc<AtomicBool>,
}

impl FakeServer {
    fn spawn(mut server: ChannelServer, authenticate: bool) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let senders = Arc::new(Mutex::new(Vec::new()));
        let hold = Arc::new(AtomicBool::new(false));
        let (requests_log, senders_log, hold_passes) =
            (requests.clone(), senders.clone(), hold.clone());

        tokio::spawn(async move {
            while let Some(mut connection) = server.accept().await {
                let sender = connection.sender();
                senders_log.lock().push(sender.clone());
                let requests_log = requests_log.clone();
                let hold_passes = hold_passes.clone();
                tokio::spawn(async move {
                    while let Some(request) = connection.next_request().await {
                        requests_log.lock().push(request.clone());
                        let request_id = request["requestId"].as_str().unwrap_or_default();
                        let _ = sender.respond(request_id).await;
                        if request["type"] == "subscribe" && authenticate {
                            let _ = sender
                                .send(json!({
                                    "type": "authenticated",
                                    "accountId": request["accountId"],
                                    "instanceIndex": request["instanceIndex"],
                                    "host": HOST,
                                    "replicas": 1
                                }))
                                .await;
                        }
                        if request["type"] == "synchronize" && !hold_passes.load(Ordering::SeqCst) {
                            for packet in synchronization_pass(&request) {
                                let _ = sender.send(packet).await;
                            }
                        }
                    }
                });
            }
        });

        Self {
            requests,
            senders,
            hold,
        }
    }

    fn hold_passes(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Send the pass of the most recent synchronize request
    async fn answer_latest_synchronization(&self) {
        let latest = self.requests("synchronize").pop();
        if let Some(request) = latest {
            for packet in synchronization_pass(&request) {
                self.sender().send(packet).await.unwrap();
            }
        }
    }

    fn requests(&self, request_type: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request["type"] == request_type)
            .cloned()
            .collect()
    }

    fn count(&self, request_type: &str) -> usize {
        self.requests(request_type).len()
    }

    fn sender(&self) -> ServerSender {
        self.senders.lock()[0].clone()
    }
}

#[derive(Default)]
struct Recorder {
    connected: Mutex<u32>,
}

#[async_trait]
impl SynchronizationListener for Recorder {
    async fn on_connected(&self, _instance: &InstanceIndex, _replicas: u32) -> ListenerResult {
        *self.connected.lock() += 1;
        Ok(())
    }
}

struct Fixture {
    router: Arc<PacketRouter>,
    hash_manager: Arc<TerminalHashManager>,
    registry: Arc<ConnectionRegistry>,
    server: FakeServer,
}

fn fixture(authenticate: bool) -> Fixture {
    let (transport, server) = ChannelTransport::pair();
    let server = FakeServer::spawn(server, authenticate);
    let router = Arc::new(PacketRouter::new(
        RouterConfig {
            status_timeout_in_seconds: 3600,
            ..Default::default()
        },
        ThrottlerConfig::default(),
        Arc::new(transport),
    ));
    router.start();
    let hash_manager = Arc::new(TerminalHashManager::new(
        HashCacheConfig::default(),
        Arc::new(StaticIgnoredFieldsProvider::default()),
    ));
    let registry = ConnectionRegistry::new(
        router.clone(),
        hash_manager.clone(),
        ConnectionConfig::default(),
        "MetaApi",
    );
    Fixture {
        router,
        hash_manager,
        registry,
        server,
    }
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_connection_synchronizes_account() {
    let _ = env_logger::try_init();
    let fixture = fixture(true);

    let handle = fixture
        .registry
        .connect(ACCOUNT, AccountType::CloudG2, None, None)
        .await
        .unwrap();
    handle.wait_synchronized(Duration::from_secs(30)).await.unwrap();

    let state = handle.terminal_state();
    assert!(handle.is_connected());
    assert_eq!(state.account_information().unwrap().server, "ICMarketsSC-Demo");
    assert_eq!(state.positions().len(), 1);
    assert_eq!(state.positions()[0].profit, dec!(-85.25));
    assert!(state.orders().is_empty());
    assert_eq!(state.specification("EURUSD").unwrap().digits, 5);
    assert_eq!(handle.history_storage().deals()[0].id, "33");

    let requests = fixture.server.requests("synchronize");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["host"], json!(HOST));
    assert_eq!(requests[0]["startingDealTime"], json!("1970-01-01T00:00:00Z"));
    assert!(requests[0].get("positionsMd5").is_none());

    // Incremental change lands on the mirrored position
    fixture
        .server
        .sender()
        .send(json!({
            "type": "update",
            "accountId": ACCOUNT,
            "instanceIndex": 0,
            "host": HOST,
            "updatedPositions": [{"id": "1", "symbol": "EURUSD", "volume": 0.07, "profit": 10}]
        }))
        .await
        .unwrap();
    eventually(|| state.position("1").is_some_and(|p| p.profit == dec!(10))).await;
    assert_eq!(state.positions().len(), 1);

    // A price arriving after the wait started releases it
    let waiter = {
        let state = state.clone();
        tokio::spawn(async move { state.wait_for_price("EURUSD", Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    fixture
        .server
        .sender()
        .send(json!({
            "type": "prices",
            "accountId": ACCOUNT,
            "instanceIndex": 0,
            "host": HOST,
            "prices": [{"symbol": "EURUSD", "bid": 1.0841, "ask": 1.0843, "time": "2026-01-05T10:00:01Z"}],
            "equity": 7400.5
        }))
        .await
        .unwrap();
    assert_eq!(waiter.await.unwrap().unwrap().bid, dec!(1.0841));
    assert_eq!(state.account_information().unwrap().equity, dec!(7400.5));

    fixture.registry.close_all().await;
    fixture.router.close();
}

#[tokio::test(start_paused = true)]
async fn test_resynchronization_reuses_cached_data_sets() {
    let _ = env_logger::try_init();
    let fixture = fixture(true);
    let handle = fixture
        .registry
        .connect(ACCOUNT, AccountType::CloudG2, None, None)
        .await
        .unwrap();
    handle.wait_synchronized(Duration::from_secs(30)).await.unwrap();
    let positions_hash = handle.terminal_state().current_hashes().positions_hash.unwrap();

    fixture
        .server
        .sender()
        .send(json!({"type": "disconnected", "accountId": ACCOUNT, "instanceIndex": 0, "host": HOST}))
        .await
        .unwrap();
    eventually(|| handle.status() == ConnectionStatus::Synchronizing).await;
    assert!(!handle.is_connected());

    // The router resubscribes on its own and a new pass follows
    eventually(|| fixture.server.count("synchronize") == 2).await;
    handle.wait_synchronized(Duration::from_secs(30)).await.unwrap();

    let second = &fixture.server.requests("synchronize")[1];
    assert_eq!(second["positionsHashes"][0], json!(positions_hash));
    assert_eq!(second["positionsMd5"], json!(positions_hash));
    assert_eq!(second["startingDealTime"], json!("2026-01-05T10:00:00Z"));
    let state = handle.terminal_state();
    assert_eq!(state.positions()[0].id, "1");
    assert_eq!(state.current_hashes().positions_hash, Some(positions_hash));
    assert_eq!(handle.history_storage().deals().len(), 1);

    fixture.registry.close_all().await;
    fixture.router.close();
}

#[tokio::test(start_paused = true)]
async fn test_registry_shares_connection_until_last_handle_closes() {
    let _ = env_logger::try_init();
    let fixture = fixture(true);

    let first = fixture
        .registry
        .connect(ACCOUNT, AccountType::CloudG2, None, None)
        .await
        .unwrap();
    let second = fixture
        .registry
        .connect(ACCOUNT, AccountType::CloudG2, None, None)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(first.connection(), second.connection()));
    assert_ne!(first.id(), second.id());
    assert_eq!(fixture.registry.connection_count(), 1);
    second.wait_synchronized(Duration::from_secs(30)).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    first.add_synchronization_listener(recorder.clone());
    assert_eq!(fixture.router.listener_count(ACCOUNT), 4);

    first.close().await;
    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(fixture.router.listener_count(ACCOUNT), 3);
    assert_eq!(fixture.registry.connection_count(), 1);
    assert_eq!(fixture.server.count("unsubscribe"), 0);

    let positions_hash = second.terminal_state().current_hashes().positions_hash.unwrap();
    second.close().await;
    assert_eq!(second.status(), ConnectionStatus::Closed);
    assert_eq!(fixture.registry.connection_count(), 0);
    assert_eq!(fixture.router.listener_count(ACCOUNT), 0);
    assert_eq!(fixture.router.event_queue_count(), 0);
    assert_eq!(fixture.server.count("unsubscribe"), 1);
    assert_eq!(
        fixture.hash_manager.positions_tree().reference_count(&positions_hash),
        0
    );
    assert_eq!(fixture.server.count("subscribe"), 1);
    assert_eq!(*recorder.connected.lock(), 0);
    fixture.router.close();
}

#[tokio::test(start_paused = true)]
async fn test_waits_time_out_and_are_cancelled_by_removal() {
    let _ = env_logger::try_init();
    let fixture = fixture(false);
    let handle = Arc::new(
        fixture
            .registry
            .connect(ACCOUNT, AccountType::CloudG1, None, None)
            .await
            .unwrap(),
    );
    assert!(handle.connection().subscribed());

    let result = handle.wait_connected(Duration::from_secs(5)).await;
    assert!(matches!(result, Err(TerminalError::Timeout(_))));

    let waiter = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.wait_synchronized(Duration::from_secs(60)).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    fixture.registry.remove(ACCOUNT).await;

    assert_eq!(waiter.await.unwrap(), Err(TerminalError::Cancelled));
    assert!(!handle.connection().subscribed());
    assert_eq!(
        handle.wait_synchronized(Duration::from_secs(1)).await,
        Err(TerminalError::Closed)
    );
    assert!(fixture.registry.connection(ACCOUNT).is_none());

    // Closing a handle of a removed connection is harmless
    handle.close().await;
    fixture.router.close();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_synchronization_is_requested_again() {
    let _ = env_logger::try_init();
    let fixture = fixture(true);
    fixture.server.hold_passes(true);
    let handle = fixture
        .registry
        .connect(ACCOUNT, AccountType::CloudG2, None, None)
        .await
        .unwrap();
    eventually(|| fixture.server.count("synchronize") == 1).await;

    // The throttler frees the slot after its synchronization timeout
    tokio::time::sleep(Duration::from_secs(25)).await;
    eventually(|| fixture.server.count("synchronize") >= 2).await;
    assert_eq!(handle.status(), ConnectionStatus::Synchronizing);
    let requests = fixture.server.requests("synchronize");
    assert_ne!(requests[0]["synchronizationId"], requests[1]["synchronizationId"]);

    fixture.server.hold_passes(false);
    fixture.server.answer_latest_synchronization().await;
    handle.wait_synchronized(Duration::from_secs(30)).await.unwrap();
    assert_eq!(handle.terminal_state().positions().len(), 1);

    // A finished pass is not requested again
    let requested = fixture.server.count("synchronize");
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(fixture.server.count("synchronize"), requested);
    assert!(handle.is_synchronized());

    fixture.registry.close_all().await;
    fixture.router.close();
}

#[tokio::test(start_paused = true)]
async fn test_pass_referring_to_collected_data_is_repeated_in_full() {
    let _ = env_logger::try_init();
    let fixture = fixture(true);
    let first = fixture
        .registry
        .connect(ACCOUNT, AccountType::CloudG2, None, None)
        .await
        .unwrap();
    first.wait_synchronized(Duration::from_secs(30)).await.unwrap();
    first.close().await;

    // Released data sets are still offered shortly before they expire
    tokio::time::sleep(Duration::from_secs(299)).await;
    fixture.server.hold_passes(true);
    let second = fixture
        .registry
        .connect(ACCOUNT, AccountType::CloudG2, None, None)
        .await
        .unwrap();
    eventually(|| fixture.server.count("synchronize") == 2).await;
    let offered = &fixture.server.requests("synchronize")[1];
    assert!(
        offered["positionsHashes"]
            .as_array()
            .is_some_and(|hashes| !hashes.is_empty())
    );

    // ...and collected before the server refers to them
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(fixture.hash_manager.collect_garbage() > 0);
    fixture.server.hold_passes(false);
    fixture.server.answer_latest_synchronization().await;

    eventually(|| fixture.server.count("synchronize") == 3).await;
    let repeated = &fixture.server.requests("synchronize")[2];
    assert!(
        repeated["positionsHashes"]
            .as_array()
            .is_none_or(|hashes| hashes.is_empty())
    );
    assert!(repeated.get("positionsMd5").is_none());

    second.wait_synchronized(Duration::from_secs(30)).await.unwrap();
    let state = second.terminal_state();
    assert_eq!(state.positions().len(), 1);
    assert_eq!(state.specification("EURUSD").unwrap().digits, 5);

    fixture.registry.close_all().await;
    fixture.router.close();
}
