//! Inbound listener and route resolution.
//!
//! Routes are keyed `(host, port, path) -> connection_id`. Each port gets one
//! listener; the path is resolved per accept against the live route table,
//! so path changes apply without rebinding. At most one client may be
//! attached to a connection id at a time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, Uri};
use axum::response::IntoResponse;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use onemux_core::{ConnectionConfig, ProxyError, ProxyHooks};

use crate::connection::ProxyConnection;

/// Route table derived from the enabled connection configs.
#[derive(Debug, Clone, Default)]
pub(crate) struct RouteTable {
    ports: HashMap<u16, PortRoutes>,
}

#[derive(Debug, Clone)]
pub(crate) struct PortRoutes {
    pub host: String,
    pub paths: HashMap<String, String>,
}

impl RouteTable {
    /// Builds the table, skipping disabled connections and malformed
    /// endpoints. Path conflicts resolve first-registered-wins.
    pub(crate) fn build(configs: &BTreeMap<String, ConnectionConfig>) -> Self {
        let mut table = RouteTable::default();
        for (connection_id, config) in configs {
            if !config.enabled {
                continue;
            }
            let route = match config.client_route() {
                Ok(route) => route,
                Err(e) => {
                    error!(connection_id, error = %e, "bad client endpoint, connection skipped");
                    continue;
                }
            };
            let port = table.ports.entry(route.port).or_insert_with(|| PortRoutes {
                host: route.host.clone(),
                paths: HashMap::new(),
            });
            if let Some(existing) = port.paths.get(&route.path) {
                warn!(
                    path = %route.path,
                    existing = %existing,
                    ignored = %connection_id,
                    "route conflict, first registration wins"
                );
                continue;
            }
            debug!(host = %port.host, port = route.port, path = %route.path, connection_id, "route registered");
            port.paths.insert(route.path, connection_id.clone());
        }
        table
    }

    pub(crate) fn resolve(&self, port: u16, path: &str) -> Option<String> {
        self.ports.get(&port)?.paths.get(path).cloned()
    }

    pub(crate) fn ports(&self) -> impl Iterator<Item = (u16, &PortRoutes)> {
        self.ports.iter().map(|(port, routes)| (*port, routes))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Accepts client sockets and hands each one to a [`ProxyConnection`].
pub struct ProxyRouter {
    hooks: ProxyHooks,
    routes: parking_lot::RwLock<RouteTable>,
    configs: parking_lot::RwLock<BTreeMap<String, ConnectionConfig>>,
    active: tokio::sync::Mutex<HashMap<String, Arc<ProxyConnection>>>,
    listeners: parking_lot::Mutex<HashMap<u16, CancellationToken>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
struct PortState {
    router: Arc<ProxyRouter>,
    port: u16,
}

impl ProxyRouter {
    pub fn new(configs: BTreeMap<String, ConnectionConfig>, hooks: ProxyHooks) -> Arc<Self> {
        let routes = RouteTable::build(&configs);
        Arc::new(Self {
            hooks,
            routes: parking_lot::RwLock::new(routes),
            configs: parking_lot::RwLock::new(configs),
            active: tokio::sync::Mutex::new(HashMap::new()),
            listeners: parking_lot::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns one listener task per routed port.
    pub fn serve(self: &Arc<Self>) {
        let table = self.routes.read().clone();
        if table.is_empty() {
            warn!("no enabled connections configured");
            return;
        }
        let mut listeners = self.listeners.lock();
        for (port, routes) in table.ports() {
            let token = self.shutdown.child_token();
            listeners.insert(port, token.clone());
            tokio::spawn(Arc::clone(self).listen_port(routes.host.clone(), port, token));
        }
    }

    async fn listen_port(self: Arc<Self>, host: String, port: u16, token: CancellationToken) {
        let listener = match tokio::net::TcpListener::bind((host.as_str(), port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(host = %host, port, error = %e, "failed to bind listener");
                self.listeners.lock().remove(&port);
                return;
            }
        };
        info!(host = %host, port, "WebSocket listener started");

        let state = PortState {
            router: Arc::clone(&self),
            port,
        };
        let app = axum::Router::new().fallback(ws_entry).with_state(state);

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await });

        if let Err(e) = served.await {
            error!(port, error = %e, "listener error");
        }
        info!(port, "WebSocket listener stopped");
    }

    /// Resolves the route, enforces the single-client rule, and runs the
    /// proxy connection to completion.
    async fn handle_socket(
        self: Arc<Self>,
        mut socket: WebSocket,
        port: u16,
        path: String,
        addr: SocketAddr,
        headers: HashMap<String, String>,
    ) {
        let Some(connection_id) = self.routes.read().resolve(port, &path) else {
            let err = ProxyError::UnknownRoute {
                port,
                path: path.clone(),
            };
            warn!(remote = %addr, error = %err, "rejecting client");
            close_with(&mut socket, close_code::POLICY, format!("no route for path {path}")).await;
            return;
        };
        let Some(config) = self.configs.read().get(&connection_id).cloned() else {
            let err = ProxyError::MissingConfig(connection_id.clone());
            error!(error = %err, "route resolved but configuration is missing");
            close_with(&mut socket, close_code::ERROR, "connection configuration missing".to_string()).await;
            return;
        };

        let conn = {
            let mut active = self.active.lock().await;
            if let Some(existing) = active.get(&connection_id) {
                if existing.is_client_open() {
                    let err = ProxyError::DuplicateClient(connection_id.clone());
                    warn!(remote = %addr, error = %err, "rejecting client");
                    close_with(
                        &mut socket,
                        close_code::POLICY,
                        "Connection already exists".to_string(),
                    )
                    .await;
                    return;
                }
                info!(connection_id, "evicting stale connection entry");
                active.remove(&connection_id);
            }
            let conn = ProxyConnection::new(
                connection_id.clone(),
                config,
                headers,
                self.hooks.clone(),
            );
            active.insert(connection_id.clone(), conn.clone());
            conn
        };

        info!(connection_id, remote = %addr, path = %path, "client attached");
        conn.clone().run(socket).await;

        let mut active = self.active.lock().await;
        if let Some(current) = active.get(&connection_id)
            && Arc::ptr_eq(current, &conn)
        {
            active.remove(&connection_id);
        }
        info!(connection_id, remote = %addr, "client detached");
    }

    /// Applies a new configuration: rebuilds the route table, starts
    /// listeners for new ports, stops listeners whose port lost all routes,
    /// and rebuilds the target set of live connections whose targets
    /// changed. Client sockets stay up throughout.
    pub async fn reload(self: &Arc<Self>, new_configs: BTreeMap<String, ConnectionConfig>) {
        info!("reloading routes");
        let table = RouteTable::build(&new_configs);
        *self.configs.write() = new_configs.clone();
        *self.routes.write() = table.clone();

        {
            let mut listeners = self.listeners.lock();
            let routed: HashSet<u16> = table.ports().map(|(port, _)| port).collect();
            let stale: Vec<u16> = listeners
                .keys()
                .filter(|port| !routed.contains(port))
                .copied()
                .collect();
            for port in stale {
                if let Some(token) = listeners.remove(&port) {
                    info!(port, "port no longer routed, stopping listener");
                    token.cancel();
                }
            }
            for (port, routes) in table.ports() {
                if listeners.contains_key(&port) {
                    continue;
                }
                info!(port, "new port routed, starting listener");
                let token = self.shutdown.child_token();
                listeners.insert(port, token.clone());
                tokio::spawn(Arc::clone(self).listen_port(routes.host.clone(), port, token));
            }
        }

        let active: Vec<(String, Arc<ProxyConnection>)> = self
            .active
            .lock()
            .await
            .iter()
            .map(|(id, conn)| (id.clone(), conn.clone()))
            .collect();
        for (connection_id, conn) in active {
            let Some(config) = new_configs.get(&connection_id) else {
                continue;
            };
            if config.enabled && conn.is_client_open() && conn.targets_differ(config) {
                conn.reload_targets(config.clone()).await;
            }
        }
        info!("route reload complete");
    }

    /// Stops all listeners and live connections.
    pub async fn shutdown(&self) {
        info!("stopping proxy router");
        self.shutdown.cancel();

        let conns: Vec<Arc<ProxyConnection>> =
            self.active.lock().await.values().cloned().collect();
        let stop_all = futures::future::join_all(conns.iter().map(|conn| conn.stop()));
        if tokio::time::timeout(Duration::from_secs(5), stop_all)
            .await
            .is_err()
        {
            warn!("some connections did not stop in time");
        }

        self.active.lock().await.clear();
        self.listeners.lock().clear();
        info!("proxy router stopped");
    }
}

async fn ws_entry(
    State(state): State<PortState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let path = uri.path().to_string();
    debug!(port = state.port, path = %path, remote = %addr, "WebSocket upgrade requested");

    let mut metadata = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            metadata.insert(name.as_str().to_lowercase(), value.to_string());
        }
    }

    ws.on_upgrade(move |socket| {
        state
            .router
            .handle_socket(socket, state.port, path, addr, metadata)
    })
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not delivered");
    }
}
