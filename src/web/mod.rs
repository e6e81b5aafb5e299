//! Admin HTTP interface: JSON-RPC on POST plus static file serving.
//!
//! Authentication is HTTP Basic against the account store. Non-admin
//! accounts may only call `getwork`, which also gives legacy getwork
//! miners a way to draw from the same provider as TCP miners.

use crate::core::constants::WORK_SIZE;
use crate::core::{midstate, WorkUnit};
use crate::error::{Error, Result};
use crate::server::registry::{ConnectionHandle, Event};
use crate::server::Server;
use crate::store::Account;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

/// Padding appended to the 80-byte header for the 128-byte getwork `data`
/// field: SHA-256 message padding for the second block.
const GETWORK_PADDING: &str =
    "000000800000000000000000000000000000000000000000000000000000000000000000000000000000000080020000";

/// The constant `hash1` scratch buffer old getwork miners expect.
const GETWORK_HASH1: &str =
    "00000000000000000000000000000000000000000000000000000000000000000000008000000000000000000000000000000000000000000000000000010000";

#[derive(Clone)]
struct WebState {
    server: Arc<Server>,
    /// Units handed out per account id, checked on submission.
    assigned: Arc<Mutex<HashMap<i64, Vec<WorkUnit>>>>,
}

/// Start the web server when a `web_port` is configured.
///
/// Returns the bound address, or `None` when the interface is disabled.
pub async fn start(server: Arc<Server>) -> Result<Option<SocketAddr>> {
    let Some(port) = server.db().get_config_opt::<u16>("web_port") else {
        return Ok(None);
    };
    let ip = server.get_config::<String>("web_ip", String::new());
    let ip = if ip.is_empty() {
        "0.0.0.0".to_string()
    } else {
        ip
    };
    let root = server.get_config::<String>("web_root", "www".to_string());

    let state = WebState {
        server,
        assigned: Arc::new(Mutex::new(HashMap::new())),
    };
    let app = Router::new()
        .route("/", post(handle_rpc))
        .fallback_service(ServeDir::new(root))
        .with_state(state);

    let listener = TcpListener::bind((ip.as_str(), port))
        .await
        .map_err(|e| Error::network(format!("failed to bind {}:{}: {}", ip, port, e)))?;
    let addr = listener.local_addr()?;
    info!("admin web interface on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("web server error: {}", e);
        }
    });

    Ok(Some(addr))
}

fn rpc_error(code: i64, message: &str) -> Value {
    json!({"result": null, "error": {"code": code, "message": message}, "id": null})
}

fn respond(status: StatusCode, value: Value) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::WWW_AUTHENTICATE, "Basic realm=\"Cluster RPC\""),
        ],
        value.to_string(),
    )
        .into_response()
}

fn authenticate(state: &WebState, headers: &HeaderMap) -> Option<Account> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(BASE64.decode(encoded).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;

    let account = Account::lookup(state.server.db(), username).ok()??;
    account.check_password(password).then_some(account)
}

async fn handle_rpc(
    State(state): State<WebState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(account) = authenticate(&state, &headers) else {
        return respond(
            StatusCode::UNAUTHORIZED,
            rpc_error(-1, "Username/password invalid."),
        );
    };

    let Ok(request) = serde_json::from_str::<Value>(&body) else {
        return respond(StatusCode::OK, rpc_error(-32700, "Parse error."));
    };
    let (id, method, params) = match (
        request.get("id"),
        request.get("method").and_then(Value::as_str),
        request.get("params").and_then(Value::as_array),
    ) {
        (Some(id), Some(method), Some(params)) => {
            (id.clone(), method.to_string(), params.clone())
        }
        _ => return respond(StatusCode::OK, rpc_error(-32600, "Invalid request.")),
    };

    if method != "getwork" && !account.is_admin() {
        return respond(
            StatusCode::OK,
            rpc_error(-2, "Non-admins restricted to getwork only."),
        );
    }

    match dispatch(&state, &account, &method, &params).await {
        Some(result) => respond(
            StatusCode::OK,
            json!({"result": result, "error": null, "id": id}),
        ),
        None => respond(StatusCode::OK, rpc_error(-32601, "Method not found.")),
    }
}

async fn dispatch(
    state: &WebState,
    account: &Account,
    method: &str,
    params: &[Value],
) -> Option<Value> {
    match method {
        "getwork" => Some(rpc_getwork(state, account, params).await),
        "getconfig" => Some(rpc_getconfig(state)),
        "setconfig" => Some(rpc_setconfig(state, params)),
        "getworker" => Some(rpc_getworker(state, params)),
        "setworkerdata" => Some(rpc_setworkerdata(state, params)),
        "setconnectionmeta" => Some(rpc_setconnectionmeta(state, params)),
        "addworker" => Some(rpc_addworker(state, params)),
        "deleteworker" => Some(rpc_deleteworker(state, params)),
        "listconnections" => Some(rpc_listconnections(state)),
        "sendmsg" => Some(rpc_sendmsg(state, params)),
        "disconnect" => Some(rpc_disconnect(state, params)),
        _ => None,
    }
}

/// Represent a connection as a JSON object.
fn dump_connection(handle: &ConnectionHandle) -> Value {
    json!({
        "username": handle.username(),
        "session": handle.session_id(),
        "ip": handle.peer().to_string(),
        "connected": handle.connected_at(),
        "meta": handle.meta(),
    })
}

fn param_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn param_session(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

async fn rpc_getwork(state: &WebState, account: &Account, params: &[Value]) -> Value {
    // With a parameter, the caller is turning in a result.
    if let Some(param) = params.first() {
        let Some(hex_str) = param.as_str() else {
            return json!(false);
        };
        if hex_str.len() != 256 {
            return json!(false);
        }
        let Ok(bytes) = hex::decode(hex_str) else {
            return json!(false);
        };
        let result = &bytes[..WORK_SIZE];

        let assigned = state
            .assigned
            .lock()
            .get(&account.id())
            .cloned()
            .unwrap_or_default();
        for unit in &assigned {
            if unit.check_result(result) {
                state.server.provider().send_result(result.to_vec());
                return json!(true);
            }
        }
        return json!(false);
    }

    let rx = state.server.provider().get_work(account.work_mask());
    let Ok(unit) = rx.await else {
        return Value::Null;
    };

    {
        let mut assigned = state.assigned.lock();
        let units = assigned.entry(account.id()).or_default();
        if units.first().is_some_and(|held| !held.is_similar_to(&unit)) {
            units.clear();
        }
        units.push(unit.clone());
    }

    let mut first_block = [0u8; 64];
    first_block.copy_from_slice(&unit.data()[..64]);

    json!({
        "midstate": hex::encode(midstate(&first_block)),
        "data": format!("{}{}", unit.to_hex(), GETWORK_PADDING),
        "hash1": GETWORK_HASH1,
        "target": unit.target().to_hex(),
        "mask": unit.mask(),
    })
}

fn rpc_getconfig(state: &WebState) -> Value {
    match state.server.db().all_config() {
        Ok(config) => json!(config),
        Err(e) => {
            warn!("getconfig failed: {}", e);
            Value::Null
        }
    }
}

fn rpc_setconfig(state: &WebState, params: &[Value]) -> Value {
    let (Some(var), Some(value)) = (param_str(params.first()), param_str(params.get(1))) else {
        return json!(false);
    };
    match state.server.set_config(&var, Some(&value)) {
        Ok(()) => json!(true),
        Err(e) => {
            warn!("setconfig failed: {}", e);
            json!(false)
        }
    }
}

fn rpc_getworker(state: &WebState, params: &[Value]) -> Value {
    let Some(username) = param_str(params.first()) else {
        return Value::Null;
    };
    let Ok(Some(worker)) = Account::lookup(state.server.db(), &username) else {
        return Value::Null;
    };

    let connections: Vec<Value> = state
        .server
        .list_account_connections(&username)
        .iter()
        .map(|handle| dump_connection(handle))
        .collect();

    json!({
        "id": worker.id(),
        "username": worker.username(),
        "data": worker.all_data().unwrap_or_default(),
        "connections": connections,
    })
}

fn rpc_setworkerdata(state: &WebState, params: &[Value]) -> Value {
    let (Some(username), Some(var), Some(value)) = (
        param_str(params.first()),
        param_str(params.get(1)),
        param_str(params.get(2)),
    ) else {
        return json!(false);
    };
    let Ok(Some(worker)) = Account::lookup(state.server.db(), &username) else {
        return json!(false);
    };
    match worker.set_data(&var, Some(&value)) {
        Ok(()) => json!(true),
        Err(e) => {
            warn!("setworkerdata failed: {}", e);
            json!(false)
        }
    }
}

fn rpc_setconnectionmeta(state: &WebState, params: &[Value]) -> Value {
    let (Some(session), Some(var), Some(value)) = (
        param_session(params.first()),
        param_str(params.get(1)),
        param_str(params.get(2)),
    ) else {
        return json!(false);
    };
    match state.server.get_connection(session) {
        Some(handle) => {
            handle.set_meta(&var, &value);
            json!(true)
        }
        None => json!(false),
    }
}

fn rpc_addworker(state: &WebState, params: &[Value]) -> Value {
    let (Some(username), Some(password)) =
        (param_str(params.first()), param_str(params.get(1)))
    else {
        return Value::Null;
    };
    if let Ok(Some(_)) = Account::lookup(state.server.db(), &username) {
        return Value::Null;
    }
    match Account::create(state.server.db(), &username)
        .and_then(|worker| worker.set_data("password", Some(&password)).map(|_| worker))
    {
        Ok(worker) => json!(worker.id()),
        Err(e) => {
            warn!("addworker failed: {}", e);
            Value::Null
        }
    }
}

fn rpc_deleteworker(state: &WebState, params: &[Value]) -> Value {
    let Some(username) = param_str(params.first()) else {
        return json!(false);
    };
    let Ok(Some(worker)) = Account::lookup(state.server.db(), &username) else {
        return json!(false);
    };
    match worker.delete() {
        Ok(()) => json!(true),
        Err(e) => {
            warn!("deleteworker failed: {}", e);
            json!(false)
        }
    }
}

fn rpc_listconnections(state: &WebState) -> Value {
    let connections: Vec<Value> = state
        .server
        .registry()
        .list()
        .iter()
        .map(|handle| dump_connection(handle))
        .collect();
    json!(connections)
}

fn rpc_sendmsg(state: &WebState, params: &[Value]) -> Value {
    let (Some(session), Some(message)) =
        (param_session(params.first()), param_str(params.get(1)))
    else {
        return json!(false);
    };
    match state.server.get_connection(session) {
        Some(handle) => json!(handle.send(Event::Msg(message))),
        None => json!(false),
    }
}

fn rpc_disconnect(state: &WebState, params: &[Value]) -> Value {
    let Some(session) = param_session(params.first()) else {
        return json!(false);
    };
    match state.server.get_connection(session) {
        Some(handle) => json!(handle.send(Event::Kick(None))),
        None => json!(false),
    }
}
