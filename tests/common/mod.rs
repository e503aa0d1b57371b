//! Test helpers: a scripted in-process IOMgr.
//!
//! The mock speaks the real wire protocol through the crate's own framing
//! functions: framed protobuf request in, framed response(s) out, chunk
//! streams in both directions. A per-test script decides how each request is
//! answered.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use siodb_rest::iomgr::framing::{
    read_chunk_size, read_exact_timed, read_message, write_chunk, write_message, REQUEST_TYPE_ID,
    RESPONSE_TYPE_ID,
};
use siodb_rest::proto::{Response, RestRequest, StatusMessage};

const MOCK_DEADLINE: Duration = Duration::from_secs(30);

/// How the mock answers one request.
#[derive(Clone, Default)]
pub struct MockReply {
    /// `rest_status_code` of the (first) response.
    pub status: u32,
    /// Application error messages to attach to the first response.
    pub messages: Vec<StatusMessage>,
    /// Echo a wrong request ID to provoke a mismatch.
    pub override_request_id: Option<u64>,
    /// Consume an inbound chunk stream before answering again (write verbs).
    pub read_payload: bool,
    /// Second response status (write verbs).
    pub second_status: Option<u32>,
    /// Response body, written as one chunk per entry plus the terminator.
    pub body_chunks: Vec<Vec<u8>>,
}

impl MockReply {
    pub fn ok_with_body(body: &[u8]) -> Self {
        Self {
            status: 200,
            body_chunks: vec![body.to_vec()],
            ..Self::default()
        }
    }

    pub fn write_flow(body: &[u8]) -> Self {
        Self {
            status: 200,
            read_payload: true,
            second_status: Some(200),
            body_chunks: vec![body.to_vec()],
            ..Self::default()
        }
    }

    pub fn app_error(status: u32, code: i32, text: &str) -> Self {
        Self {
            status,
            messages: vec![StatusMessage {
                status_code: code,
                text: text.to_owned(),
            }],
            ..Self::default()
        }
    }
}

/// One request observed by the mock, with any payload it carried.
#[derive(Clone)]
pub struct Received {
    pub request: RestRequest,
    pub payload: Vec<u8>,
}

pub struct MockIoMgr {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
}

impl MockIoMgr {
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

/// Starts the scripted IOMgr on an ephemeral port.
pub async fn start_mock_iomgr<F>(script: F) -> MockIoMgr
where
    F: Fn(&RestRequest) -> MockReply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let script = Arc::new(script);

    let log = received.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let script = script.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let _ = serve_connection(socket, script, log).await;
            });
        }
    });

    MockIoMgr { addr, received }
}

async fn serve_connection(
    mut socket: TcpStream,
    script: Arc<dyn Fn(&RestRequest) -> MockReply + Send + Sync>,
    log: Arc<Mutex<Vec<Received>>>,
) -> Result<(), siodb_rest::iomgr::IoMgrError> {
    loop {
        let request: RestRequest =
            match read_message(&mut socket, REQUEST_TYPE_ID, MOCK_DEADLINE).await {
                Ok(request) => request,
                Err(_) => return Ok(()),
            };

        let reply = script(&request);
        let request_id = reply.override_request_id.unwrap_or(request.request_id);

        let first = Response {
            request_id,
            rest_status_code: reply.status,
            message: reply.messages.clone(),
        };
        write_message(&mut socket, RESPONSE_TYPE_ID, &first).await?;

        // An application error ends the exchange; no payload, no body.
        if !reply.messages.is_empty() {
            log.lock().unwrap().push(Received {
                request,
                payload: Vec::new(),
            });
            continue;
        }

        let mut payload = Vec::new();
        if reply.read_payload {
            loop {
                let size = read_chunk_size(&mut socket, MOCK_DEADLINE).await?;
                if size == 0 {
                    break;
                }
                let start = payload.len();
                payload.resize(start + size as usize, 0);
                read_exact_timed(&mut socket, &mut payload[start..], MOCK_DEADLINE).await?;
            }

            if let Some(status) = reply.second_status {
                let second = Response {
                    request_id,
                    rest_status_code: status,
                    message: vec![],
                };
                write_message(&mut socket, RESPONSE_TYPE_ID, &second).await?;
            }
        }

        for chunk in &reply.body_chunks {
            write_chunk(&mut socket, chunk).await?;
        }
        write_chunk(&mut socket, b"").await?;

        log.lock().unwrap().push(Received { request, payload });
    }
}
