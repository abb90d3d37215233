// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! End-to-end UDP request/response scenarios against a live server.

use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;
use takagi::codec;
use takagi::message::{Message, MessageType};
use takagi::protocol::constants as c;
use takagi::App;

fn live_app() -> App {
    let app = App::builder("e2e")
        .bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .port(0)
        .without_tcp()
        .build();
    app.start().unwrap();
    app
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

fn exchange(app: &App, socket: &UdpSocket, request: &Message) -> Message {
    let wire = codec::udp::encode(request).unwrap();
    socket.send_to(&wire, app.udp_addr().unwrap()).unwrap();
    let mut buf = [0u8; 65535];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    codec::udp::decode(&buf[..len]).unwrap()
}

#[test]
fn get_ping_returns_pong_json() {
    let app = live_app();
    let socket = client();

    let mut request = Message::udp(MessageType::Non, c::METHOD_GET, 0x0101, vec![0x11]);
    request.set_path("/ping");
    let response = exchange(&app, &socket, &request);

    assert_eq!(response.code, c::CODE_CONTENT);
    assert_eq!(response.mtype, Some(MessageType::Non));
    assert_eq!(response.token, vec![0x11]);
    assert_eq!(
        response.options.uint(c::OPT_CONTENT_FORMAT),
        Some(u32::from(c::FORMAT_JSON))
    );
    assert_eq!(response.payload, br#"{"message":"Pong"}"#);

    app.stop();
}

#[test]
fn post_echo_piggybacks_ack_with_same_correlates() {
    let app = live_app();
    let socket = client();

    let mut request = Message::udp(MessageType::Con, c::METHOD_POST, 0x4242, vec![0xCA, 0xFE]);
    request.set_path("/echo");
    request
        .options
        .insert_uint(c::OPT_CONTENT_FORMAT, u32::from(c::FORMAT_JSON));
    request.payload = serde_json::to_vec(&json!({ "message": "hi" })).unwrap();

    let response = exchange(&app, &socket, &request);
    assert_eq!(response.mtype, Some(MessageType::Ack));
    assert_eq!(response.message_id, Some(0x4242));
    assert_eq!(response.token, vec![0xCA, 0xFE]);
    assert_eq!(response.code, c::CODE_CONTENT);
    assert_eq!(response.payload, br#"{"echo":"hi"}"#);

    app.stop();
}

#[test]
fn discovery_returns_link_format() {
    let app = live_app();
    app.observable("/sensors/temp").unwrap();
    let socket = client();

    let mut request = Message::udp(MessageType::Con, c::METHOD_GET, 7, vec![0x01]);
    request.set_path("/.well-known/core");
    let response = exchange(&app, &socket, &request);

    assert_eq!(response.code, c::CODE_CONTENT);
    assert_eq!(
        response.options.uint(c::OPT_CONTENT_FORMAT),
        Some(u32::from(c::FORMAT_LINK_FORMAT))
    );
    let body = String::from_utf8(response.payload).unwrap();
    assert!(body.contains("</ping>"), "{}", body);
    assert!(body.contains("rt=\"core.discovery\""), "{}", body);
    assert!(body.contains("</sensors/temp>"), "{}", body);

    app.stop();
}

#[test]
fn missing_route_is_not_found() {
    let app = live_app();
    let socket = client();

    let mut request = Message::udp(MessageType::Con, c::METHOD_GET, 9, vec![0x01]);
    request.set_path("/definitely/absent");
    let response = exchange(&app, &socket, &request);

    assert_eq!(response.code, c::CODE_NOT_FOUND);
    assert_eq!(response.payload, br#"{"error":"Not Found"}"#);

    app.stop();
}

#[test]
fn parameterized_route_extracts_params() {
    let app = live_app();
    app.router()
        .route("GET", "/users/:id/posts/:pid", |_req, ctx| {
            Ok(ctx.reply().json(json!({
                "id": ctx.param("id"),
                "pid": ctx.param("pid"),
            })))
        })
        .unwrap();
    let socket = client();

    let mut request = Message::udp(MessageType::Con, c::METHOD_GET, 21, vec![0x05]);
    request.set_path("/users/7/posts/42");
    let response = exchange(&app, &socket, &request);

    assert_eq!(response.code, c::CODE_CONTENT);
    let body: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(body["id"], "7");
    assert_eq!(body["pid"], "42");

    app.stop();
}
