//! In-process portal replaying scripted responses.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::{json, Value};

#[derive(Clone, Debug)]
pub enum Reply {
    Blocks {
        blocks: Vec<(u64, &'static str)>,
        finalized: Option<(u64, &'static str)>,
    },
    /// Body cut into pieces of `chunk_size` bytes, splitting lines across chunks.
    Chunked {
        blocks: Vec<(u64, &'static str)>,
        chunk_size: usize,
    },
    /// Sends `blocks` and the start of one more line, then aborts the connection.
    Broken {
        blocks: Vec<(u64, &'static str)>,
        partial: &'static str,
    },
    Status(u16),
    NoData,
    Fork(Vec<(u64, &'static str)>),
}

impl Reply {
    pub fn chunked(blocks: &[(u64, &'static str)], chunk_size: usize) -> Self {
        Self::Chunked {
            blocks: blocks.to_vec(),
            chunk_size,
        }
    }

    pub fn broken(blocks: &[(u64, &'static str)], partial: &'static str) -> Self {
        Self::Broken {
            blocks: blocks.to_vec(),
            partial,
        }
    }

    pub fn blocks(blocks: &[(u64, &'static str)]) -> Self {
        Self::Blocks {
            blocks: blocks.to_vec(),
            finalized: None,
        }
    }

    pub fn blocks_with_finalized(blocks: &[(u64, &'static str)], finalized: (u64, &'static str)) -> Self {
        Self::Blocks {
            blocks: blocks.to_vec(),
            finalized: Some(finalized),
        }
    }
}

#[derive(Clone, Default)]
pub struct MockPortal {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<Value>>>,
    head: Arc<Mutex<Option<(u64, &'static str)>>>,
}

impl MockPortal {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Default::default()
        }
    }

    pub fn set_head(&self, head: (u64, &'static str)) {
        *self.head.lock().unwrap() = Some(head);
    }

    /// Bodies of every stream request received so far.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    /// Starts serving on a random local port and returns the base url.
    pub async fn serve(&self) -> String {
        let _ = env_logger::builder().is_test(true).try_init();

        let app = Router::new()
            .route("/stream", post(stream))
            .route("/finalized-stream", post(stream))
            .route("/head", get(head))
            .route("/finalized-head", get(head))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}")
    }
}

pub fn block_json(number: u64, hash: &str) -> Value {
    json!({
        "header": {
            "number": number,
            "hash": hash,
            "timestamp": number * 1000,
        }
    })
}

fn ndjson(blocks: &[(u64, &str)]) -> String {
    blocks
        .iter()
        .map(|(number, hash)| format!("{}\n", block_json(*number, hash)))
        .collect()
}

async fn head(State(mock): State<MockPortal>) -> Response {
    match *mock.head.lock().unwrap() {
        Some((number, hash)) => Json(json!({ "number": number, "hash": hash })).into_response(),
        None => (StatusCode::OK, "").into_response(),
    }
}

async fn stream(State(mock): State<MockPortal>, body: Bytes) -> Response {
    mock.requests
        .lock()
        .unwrap()
        .push(serde_json::from_slice(&body).unwrap());

    let reply = mock.replies.lock().unwrap().pop_front();
    match reply {
        None | Some(Reply::NoData) => StatusCode::NO_CONTENT.into_response(),
        Some(Reply::Status(code)) => StatusCode::from_u16(code).unwrap().into_response(),
        Some(Reply::Fork(previous)) => {
            let previous_blocks: Vec<Value> = previous
                .iter()
                .map(|(number, hash)| json!({ "number": number, "hash": hash }))
                .collect();
            (
                StatusCode::CONFLICT,
                Json(json!({ "previousBlocks": previous_blocks })),
            )
                .into_response()
        }
        Some(Reply::Chunked { blocks, chunk_size }) => {
            let body = ndjson(&blocks).into_bytes();
            let chunks: Vec<Result<Vec<u8>, io::Error>> = body
                .chunks(chunk_size)
                .map(|chunk| Ok(chunk.to_vec()))
                .collect();

            (StatusCode::OK, Body::from_stream(futures::stream::iter(chunks))).into_response()
        }
        Some(Reply::Broken { blocks, partial }) => {
            let head = futures::stream::iter(vec![
                Ok::<_, io::Error>(ndjson(&blocks)),
                Ok(partial.to_owned()),
            ]);
            // give the server a chance to flush what was sent before the abort
            let abort = futures::stream::once(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "portal went away"))
            });

            (StatusCode::OK, Body::from_stream(head.chain(abort))).into_response()
        }
        Some(Reply::Blocks { blocks, finalized }) => {
            let mut headers = HeaderMap::new();
            if let Some((number, hash)) = finalized {
                headers.insert(
                    "x-sqd-finalized-head-number",
                    number.to_string().parse().unwrap(),
                );
                headers.insert("x-sqd-finalized-head-hash", hash.parse().unwrap());
            }

            (StatusCode::OK, headers, ndjson(&blocks)).into_response()
        }
    }
}
