//! HTTP surface and websocket observers.
//!
//! `GET /` either upgrades into the observer protocol or renders the index
//! with the published known-languages list.  Each observer gets a reader
//! task (parses `setLangs` selections) and a writer task (filters and
//! serializes the deletion feed); either side failing tears down only that
//! observer.
//!
//! `/ready` is registered outside the canonical-host redirect; health
//! probes arrive with a different `Host`.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use maud::{DOCTYPE, Markup, PreEscaped, html};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcaster::{KnownLangs, OBSERVER_BUFFER, ObserverSender, ObserverUpdate};
use crate::langs::listening_for;
use crate::likes::LikedPost;
use crate::metrics;

#[derive(Clone)]
pub struct AppState {
    /// Registers a new observer's update channel with the broadcaster.
    pub observers: mpsc::Sender<ObserverSender>,
    /// Published known-languages list, written by the broadcaster.
    pub known_langs: KnownLangs,
    /// Canonical host; mismatched requests are redirected when set.
    pub host: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    crate::metrics::init();

    let guarded = Router::new()
        .route("/", get(root))
        .route("/metrics", get(serve_metrics))
        .route("/oops", post(oops))
        .layer(middleware::from_fn_with_state(state.clone(), enforce_host));

    Router::new()
        .route("/ready", get(ready))
        .merge(guarded)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    req: Request,
) -> Response {
    if wants_websocket(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => {
                let selection = LangSelection::from_query(&params);
                upgrade
                    .on_upgrade(move |socket| handle_observer(socket, state, selection))
                    .into_response()
            }
            Err(rejection) => rejection.into_response(),
        };
    }

    let known = state.known_langs.read().await.clone();
    let browser = browser_langs(
        req.headers()
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok()),
    );
    let page = index_page(&known, &browser);
    (
        [
            (header::CACHE_CONTROL, "public, max-age=300, immutable"),
            (header::VARY, "accept-language"),
        ],
        Html(page.into_string()),
    )
        .into_response()
}

async fn ready() -> &'static str {
    "ready"
}

async fn serve_metrics() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], metrics::render())
}

/// Client-side error reports.  Decode failures are logged and swallowed;
/// a report about a broken page should not itself error.
async fn oops(headers: HeaderMap, body: String) -> impl IntoResponse {
    let mut report = match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&body)
    {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "failed to decode client error report, continuing");
            serde_json::Map::new()
        }
    };
    let ua = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    report.insert("ua".to_owned(), serde_json::Value::String(ua.to_owned()));
    warn!(report = %serde_json::Value::Object(report), "client error report");
    (StatusCode::CREATED, "got it. and sorry :/")
}

/// Redirect to the canonical host when one is configured.
async fn enforce_host(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = &state.host {
        let request_host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok());
        if request_host != Some(expected.as_str()) {
            let path_and_query = req
                .uri()
                .path_and_query()
                .map_or("/", |pq| pq.as_str());
            let location = format!("https://{expected}{path_and_query}");
            return (
                StatusCode::MOVED_PERMANENTLY,
                [(header::LOCATION, location)],
            )
                .into_response();
        }
    }
    next.run(req).await
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

// ---------------------------------------------------------------------------
// Observer protocol
// ---------------------------------------------------------------------------

/// A connection's language filter.  `None` in the wire list (or the literal
/// query value `"null"`) selects posts with no language tag.
#[derive(Debug, Clone, Default)]
struct LangSelection {
    langs: HashSet<String>,
    wants_unknown: bool,
}

impl LangSelection {
    fn from_query(params: &[(String, String)]) -> Self {
        let mut selection = LangSelection::default();
        for (key, value) in params {
            if key != "lang" {
                continue;
            }
            if value == "null" {
                selection.wants_unknown = true;
            } else if !value.is_empty() {
                selection.langs.insert(value.clone());
            }
        }
        selection
    }

    fn from_wire(langs: Vec<Option<String>>) -> Self {
        let mut selection = LangSelection::default();
        for lang in langs {
            match lang {
                None => selection.wants_unknown = true,
                Some(lang) => {
                    selection.langs.insert(lang);
                }
            }
        }
        selection
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "setLangs")]
    SetLangs { langs: Vec<Option<String>> },
}

async fn handle_observer(socket: WebSocket, state: AppState, initial: LangSelection) {
    let (updates_tx, mut updates_rx) = mpsc::channel(OBSERVER_BUFFER);
    if state.observers.send(updates_tx).await.is_err() {
        return;
    }
    info!("observer connected");

    let (mut sink, mut stream) = socket.split();
    let (selection_tx, mut selection_rx) = mpsc::channel::<LangSelection>(4);

    // Reader: socket -> selection updates.  Ends on socket close or error.
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::SetLangs { langs }) => {
                    if selection_tx
                        .send(LangSelection::from_wire(langs))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "ignoring unparseable observer message"),
            }
        }
    });

    // Writer: multiplex the update feed and selection changes.
    let mut selection = initial;
    loop {
        tokio::select! {
            update = updates_rx.recv() => {
                // A closed channel means the broadcaster evicted us.
                let Some(update) = update else { break };
                let frame = match update {
                    ObserverUpdate::Post(liked) => {
                        if !listening_for(&selection.langs, selection.wants_unknown, &liked.post.langs) {
                            continue;
                        }
                        post_frame(&liked)
                    }
                    ObserverUpdate::Observers(count) => observers_frame(count),
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            new_selection = selection_rx.recv() => {
                match new_selection {
                    Some(new_selection) => selection = new_selection,
                    None => break, // reader gone, socket is down
                }
            }
        }
    }
    reader.abort();
    info!("observer disconnected");
}

fn post_frame(liked: &LikedPost) -> String {
    let age_ms = ((Utc::now().timestamp_micros() - liked.post.time_us) / 1000).max(0);
    serde_json::json!({
        "type": "post",
        "post": {
            "age": age_ms,
            "likes": liked.likes,
            "value": {
                "text": liked.post.text,
                "target": liked.post.target,
            },
        },
    })
    .to_string()
}

fn observers_frame(count: usize) -> String {
    serde_json::json!({ "type": "observers", "observers": count }).to_string()
}

// ---------------------------------------------------------------------------
// Index page
// ---------------------------------------------------------------------------

/// `Accept-Language`, reduced to base tags: split on `,`, trim, cut at `;`
/// and `-`, dedup preserving order.  Empty entries survive as the
/// wants-unknown sentinel.
fn browser_langs(header: Option<&str>) -> Vec<Option<String>> {
    let mut seen = HashSet::new();
    let mut langs = Vec::new();
    for part in header.unwrap_or("").split(',') {
        let lang = part.trim();
        let lang = lang.split(';').next().unwrap_or(lang);
        let lang = lang.split('-').next().unwrap_or(lang);
        let entry = (!lang.is_empty()).then(|| lang.to_owned());
        if seen.insert(entry.clone()) {
            langs.push(entry);
        }
    }
    langs
}

const OBSERVER_SCRIPT: &str = r#"
const feed = document.getElementById('feed');
const count = document.getElementById('observers');
const form = document.getElementById('langs');
const proto = location.protocol === 'https:' ? 'wss:' : 'ws:';

function selectedLangs() {
  return [...form.querySelectorAll('input:checked')]
    .map((el) => el.value === 'null' ? null : el.value);
}

const sock = new WebSocket(proto + '//' + location.host + '/?' +
  selectedLangs().map((l) => 'lang=' + (l === null ? 'null' : l)).join('&'));

sock.addEventListener('message', (e) => {
  const msg = JSON.parse(e.data);
  if (msg.type === 'observers') {
    count.textContent = msg.observers;
  } else if (msg.type === 'post') {
    const el = document.createElement('article');
    el.textContent = msg.post.value.text;
    feed.prepend(el);
    while (feed.children.length > 50) feed.lastChild.remove();
  }
});

form.addEventListener('change', () => {
  sock.send(JSON.stringify({ type: 'setLangs', langs: selectedLangs() }));
});
"#;

fn index_page(known_langs: &[String], browser_langs: &[Option<String>]) -> Markup {
    let wants_unknown = browser_langs.contains(&None);
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                title { "final words" }
            }
            body {
                h1 { "final words" }
                p { "posts, the instant they are deleted. watching along: " span #observers { "0" } }
                form #langs {
                    @for lang in known_langs {
                        label {
                            input type="checkbox" name="lang" value=(lang)
                                checked[browser_langs.contains(&Some(lang.clone()))];
                            " " (lang)
                        }
                    }
                    label {
                        input type="checkbox" name="lang" value="null" checked[wants_unknown];
                        " no language tag"
                    }
                }
                section #feed {}
                script { (PreEscaped(OBSERVER_SCRIPT)) }
            }
        }
    }
}
