// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! End-to-end Observe flow: register over UDP, receive pushed
//! notifications with monotonically increasing sequence numbers.

use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;
use takagi::codec;
use takagi::message::{Message, MessageType};
use takagi::protocol::constants as c;
use takagi::App;

fn recv(socket: &UdpSocket) -> Message {
    let mut buf = [0u8; 65535];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    codec::udp::decode(&buf[..len]).unwrap()
}

#[test]
fn observe_register_then_push_notifications() {
    let app = App::builder("observer-e2e")
        .bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .port(0)
        .without_tcp()
        .build();
    app.observable("/sensors/temp").unwrap();
    app.start().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    // GET with Observe=0 registers and answers with the Observe option.
    let mut register = Message::udp(MessageType::Con, c::METHOD_GET, 0x0E0E, vec![0x0B]);
    register.set_path("/sensors/temp");
    register.options.insert_uint(c::OPT_OBSERVE, 0);
    socket
        .send_to(
            &codec::udp::encode(&register).unwrap(),
            app.udp_addr().unwrap(),
        )
        .unwrap();

    let initial = recv(&socket);
    assert_eq!(initial.code, c::CODE_CONTENT);
    assert_eq!(initial.token, vec![0x0B]);
    assert!(initial.options.contains(c::OPT_OBSERVE));
    assert_eq!(app.observe().subscriber_count("/sensors/temp"), 1);

    // Server-side notifications arrive as NON with increasing Observe.
    app.notify("/sensors/temp", json!({ "v": 20 }));
    let first = recv(&socket);
    assert_eq!(first.mtype, Some(MessageType::Non));
    assert_eq!(first.code, c::CODE_CONTENT);
    assert_eq!(first.token, vec![0x0B]);
    let first_seq = first.options.uint(c::OPT_OBSERVE).unwrap();
    assert_eq!(first.payload, br#"{"v":20}"#);

    app.notify("/sensors/temp", json!({ "v": 21 }));
    let second = recv(&socket);
    let second_seq = second.options.uint(c::OPT_OBSERVE).unwrap();
    assert!(second_seq > first_seq, "{} > {}", second_seq, first_seq);
    assert_eq!(second.payload, br#"{"v":21}"#);

    app.stop();
}

#[test]
fn rst_receipt_drops_subscription() {
    let app = App::builder("observer-rst")
        .bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .port(0)
        .without_tcp()
        .build();
    app.observable("/alerts").unwrap();
    app.start().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let mut register = Message::udp(MessageType::Con, c::METHOD_GET, 1, vec![0x0C]);
    register.set_path("/alerts");
    register.options.insert_uint(c::OPT_OBSERVE, 0);
    socket
        .send_to(
            &codec::udp::encode(&register).unwrap(),
            app.udp_addr().unwrap(),
        )
        .unwrap();
    let _initial = recv(&socket);
    assert_eq!(app.observe().subscriber_count("/alerts"), 1);

    // A reset from the observer cancels its subscriptions.
    let rst = Message::udp(MessageType::Rst, 0, 2, Vec::new());
    socket
        .send_to(&codec::udp::encode(&rst).unwrap(), app.udp_addr().unwrap())
        .unwrap();

    // The server processes the RST asynchronously.
    let mut remaining = 20;
    while app.observe().subscriber_count("/alerts") > 0 && remaining > 0 {
        std::thread::sleep(Duration::from_millis(50));
        remaining -= 1;
    }
    assert_eq!(app.observe().subscriber_count("/alerts"), 0);

    app.stop();
}
