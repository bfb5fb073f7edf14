// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use coap_core::block::BlockInfo;
use coap_core::config::Config;
use coap_core::content_format::ContentFormat;
use coap_core::handler::{Handler, ResponseWriter};
use coap_core::message::{MsgCode, MsgToken, MsgType, OwnedMessage};
use coap_core::session::Session;
use coap_core::tokens::TokenKind;
use coap_core::transport::LoopbackTransport;
use coap_core::worker_pool::{TokioWorkerPool, WorkerPool};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[tokio::test]
async fn block1_request_is_reassembled_before_reaching_handler() {
    let _ = env_logger::try_init();
    let (client_transport, server_transport) = LoopbackTransport::new_pair(addr(100), addr(101));
    let worker_pool: Arc<dyn WorkerPool> = Arc::new(TokioWorkerPool::new(4));

    let received_len = Arc::new(AtomicUsize::new(0));
    let received_len2 = received_len.clone();
    let handler: Arc<dyn Handler> = Arc::new(move |req: OwnedMessage, mut resp: ResponseWriter| {
        let received_len = received_len2.clone();
        async move {
            received_len.store(req.as_message().payload().len(), Ordering::SeqCst);
            resp.set_response(MsgCode::SuccessChanged, None, Vec::new());
            resp
        }
    });

    let (server, server_rx) = Session::new(Arc::new(server_transport), addr(100), Config::default(), worker_pool.clone(), Some(handler));
    tokio::spawn(server.clone().run(server_rx));

    let (client, client_rx) = Session::new(Arc::new(client_transport), addr(101), Config::default(), worker_pool, None);
    tokio::spawn(client.clone().run(client_rx));

    let token = MsgToken::from(0x42u32);
    let payload = vec![0x5Au8; 2560];
    let szx = 6; // 1024-byte blocks

    for (num, more, chunk) in [
        (0u32, true, &payload[0..1024]),
        (1u32, true, &payload[1024..2048]),
        (2u32, false, &payload[2048..2560]),
    ] {
        let mut request = OwnedMessage::new();
        request.set_msg_code(MsgCode::MethodPut);
        request.set_msg_token(token);
        request.insert_option(coap_core::option::BLOCK1, BlockInfo::new(num, more, szx).unwrap()).unwrap();
        request.append_payload_bytes(chunk).unwrap();

        let (mut rx, _cancel) = client.send_request(request, TokenKind::OneShot).await;
        let response = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("response arrived before timeout")
            .expect("channel open")
            .expect("no error");

        if more {
            assert_eq!(response.as_message().msg_code(), MsgCode::SuccessContinue);
        } else {
            assert_eq!(response.as_message().msg_code(), MsgCode::SuccessChanged);
        }
    }

    assert_eq!(received_len.load(Ordering::SeqCst), 2560);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn duplicate_confirmable_request_is_answered_from_the_dedup_cache() {
    let _ = env_logger::try_init();
    let (client_transport, server_transport) = LoopbackTransport::new_pair(addr(102), addr(103));
    let worker_pool: Arc<dyn WorkerPool> = Arc::new(TokioWorkerPool::new(4));

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations2 = invocations.clone();
    let handler: Arc<dyn Handler> = Arc::new(move |req: OwnedMessage, mut resp: ResponseWriter| {
        let invocations = invocations2.clone();
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            let payload = req.as_message().payload().to_vec();
            resp.set_response(MsgCode::SuccessContent, Some(ContentFormat::TEXT_PLAIN_UTF8), payload);
            resp
        }
    });

    let (server, server_rx) = Session::new(Arc::new(server_transport), addr(102), Config::default(), worker_pool, Some(handler));
    tokio::spawn(server.clone().run(server_rx));

    let injector = client_transport.injector();

    let mut request = OwnedMessage::new();
    request.set_msg_type(MsgType::Con);
    request.set_msg_code(MsgCode::MethodGet);
    request.set_msg_id(77);
    request.set_msg_token(MsgToken::from(0x99u32));
    request.append_payload_bytes(b"hi").unwrap();
    let datagram = request.as_bytes().to_vec();

    injector.send((datagram.clone(), addr(103))).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Same message id from the same remote: must be answered from the
    // dedup cache rather than re-invoking the handler.
    injector.send((datagram, addr(103))).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    server.shutdown();
}
