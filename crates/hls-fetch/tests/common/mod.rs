#![allow(dead_code)] // shared between test binaries; not all of them use everything

//! In-process HLS fixture servers for the integration suite.
//!
//! Two flavors:
//! - a scripted server that replays a fixed sequence of responses (repeating
//!   the last one), for VOD/roll/error scenarios;
//! - a low-latency server that models a part-by-part live edge and honors
//!   `_HLS_msn`/`_HLS_part` blocking-reload parameters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use url::Url;

pub const PLAYLIST_MIME: &str = "application/vnd.apple.mpegurl";

/// One scripted response.
#[derive(Clone)]
pub enum Step {
    /// Media/master playlist body served with the playlist MIME type.
    Playlist(String),
    /// Arbitrary body with an arbitrary content type.
    Raw {
        body: String,
        content_type: &'static str,
    },
    /// A bare status code with no usable body.
    Status(u16),
}

pub struct ScriptedState {
    steps: VecDeque<Step>,
    pub requests: u64,
}

/// Start a server that answers every path from the script, repeating the
/// final step forever. Returns the base URL and the shared state.
pub async fn start_scripted(steps: Vec<Step>) -> (Url, Arc<Mutex<ScriptedState>>) {
    let state = Arc::new(Mutex::new(ScriptedState {
        steps: steps.into(),
        requests: 0,
    }));

    let handler_state = Arc::clone(&state);
    let app = Router::new().fallback(move |_req: Request| {
        let state = Arc::clone(&handler_state);
        async move {
            let step = {
                let mut state = state.lock().unwrap();
                state.requests += 1;
                let step = state.steps.pop_front().expect("fixture script exhausted");
                if state.steps.is_empty() {
                    state.steps.push_back(step.clone());
                }
                step
            };
            respond(step)
        }
    });

    (serve(app).await, state)
}

pub fn request_count(state: &Arc<Mutex<ScriptedState>>) -> u64 {
    state.lock().unwrap().requests
}

/// Live playlist with `segment_count` one-second segments starting at
/// `media_sequence`.
pub fn media_playlist(
    media_sequence: u64,
    segment_count: u64,
    target_duration: u64,
    ended: bool,
) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
    for msn in media_sequence..media_sequence + segment_count {
        out.push_str(&format!("#EXTINF:1.0,\nseg{msn}.ts\n"));
    }
    if ended {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

pub fn master_playlist() -> String {
    "#EXTM3U\n\
     #EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720\n\
     hi/index.m3u8\n\
     #EXT-X-STREAM-INF:BANDWIDTH=320000,RESOLUTION=640x360\n\
     lo/index.m3u8\n"
        .to_string()
}

/// Parameters of the low-latency fixture.
///
/// The live edge is a single counter `p` of published parts:
/// `msn = base_msn + p / parts_per_segment`, tail length `p %
/// parts_per_segment`. A blocking request advances `p` until the requested
/// head exists (capped at `end_p`, where the playlist gains `ENDLIST`).
#[derive(Clone, Copy)]
pub struct LlConfig {
    pub base_msn: u64,
    pub parts_per_segment: u64,
    pub start_p: u64,
    pub end_p: u64,
}

pub struct LlState {
    pub p: u64,
    pub requests: u64,
}

pub async fn start_low_latency(config: LlConfig) -> (Url, Arc<Mutex<LlState>>) {
    let state = Arc::new(Mutex::new(LlState {
        p: config.start_p,
        requests: 0,
    }));

    let handler_state = Arc::clone(&state);
    let app = Router::new().fallback(move |req: Request| {
        let state = Arc::clone(&handler_state);
        async move {
            let query: HashMap<String, String> = req
                .uri()
                .query()
                .map(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .into_owned()
                        .collect()
                })
                .unwrap_or_default();

            let body = {
                let mut state = state.lock().unwrap();
                state.requests += 1;

                if let Some(msn) = query.get("_HLS_msn").and_then(|v| v.parse::<u64>().ok()) {
                    let rel = msn.saturating_sub(config.base_msn);
                    let target = match query.get("_HLS_part").and_then(|v| v.parse::<u64>().ok())
                    {
                        Some(part) => rel * config.parts_per_segment + part + 1,
                        None => (rel + 1) * config.parts_per_segment,
                    };
                    state.p = state.p.max(target).min(config.end_p);
                }

                let ended = state.p >= config.end_p;
                ll_playlist(config, state.p, ended)
            };
            respond(Step::Playlist(body))
        }
    });

    (serve(app).await, state)
}

fn ll_playlist(config: LlConfig, p: u64, ended: bool) -> String {
    let pps = config.parts_per_segment;
    let tail_msn = config.base_msn + p / pps;
    let tail_parts = p % pps;

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:9\n#EXT-X-TARGETDURATION:1\n");
    out.push_str("#EXT-X-PART-INF:PART-TARGET=0.2\n");
    out.push_str("#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK=0.6\n");
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", config.base_msn));

    for msn in config.base_msn..tail_msn {
        // Only the freshest full segments still advertise their parts.
        if msn + 2 >= tail_msn {
            for part in 0..pps {
                out.push_str(&format!(
                    "#EXT-X-PART:DURATION=0.2,URI=\"seg{msn}.part{part}.mp4\"\n"
                ));
            }
        }
        out.push_str(&format!("#EXTINF:1.0,\nseg{msn}.mp4\n"));
    }
    for part in 0..tail_parts {
        out.push_str(&format!(
            "#EXT-X-PART:DURATION=0.2,URI=\"seg{tail_msn}.part{part}.mp4\"\n"
        ));
    }

    if ended {
        out.push_str("#EXT-X-ENDLIST\n");
    } else {
        out.push_str(&format!(
            "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"seg{tail_msn}.part{tail_parts}.mp4\"\n"
        ));
    }
    out
}

fn respond(step: Step) -> Response {
    match step {
        Step::Playlist(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(PLAYLIST_MIME))],
            body,
        )
            .into_response(),
        Step::Raw { body, content_type } => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
            body,
        )
            .into_response(),
        Step::Status(code) => Response::builder()
            .status(StatusCode::from_u16(code).unwrap())
            .body(Body::from(""))
            .unwrap(),
    }
}

/// Bind on an ephemeral local port and serve in the background.
async fn serve(app: Router) -> Url {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind fixture");
    listener
        .set_nonblocking(true)
        .expect("failed to set fixture listener non-blocking");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::from_std(listener)
            .expect("failed to adopt fixture listener");
        axum::serve(listener, app).await.unwrap();
    });

    Url::parse(&format!("http://{addr}/")).unwrap()
}
