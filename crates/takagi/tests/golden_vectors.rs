// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Byte-level golden vectors for the wire codecs.

use takagi::codec::{self, bytes_to_uint, uint_to_bytes};
use takagi::message::{Message, MessageType};
use takagi::protocol::constants as c;

#[test]
fn udp_get_ping_vector() {
    let mut msg = Message::udp(MessageType::Con, c::METHOD_GET, 0x1234, vec![0xDE, 0xAD]);
    msg.set_path("/ping");
    let wire = codec::udp::encode(&msg).unwrap();

    assert_eq!(
        wire,
        vec![
            0x42, // ver 1, CON, TKL 2
            0x01, // 0.01 GET
            0x12, 0x34, // message id
            0xDE, 0xAD, // token
            0xB4, // Uri-Path (delta 11), length 4
            b'p', b'i', b'n', b'g',
        ]
    );
    assert_eq!(codec::udp::decode(&wire).unwrap(), msg);
}

#[test]
fn udp_piggybacked_ack_vector() {
    let mut msg = Message::udp(MessageType::Ack, c::CODE_CONTENT, 0xBEEF, vec![0x01]);
    msg.options.insert_uint(c::OPT_CONTENT_FORMAT, 50);
    msg.payload = br#"{"echo":"hi"}"#.to_vec();
    let wire = codec::udp::encode(&msg).unwrap();

    assert_eq!(wire[0], 0x61); // ver 1, ACK, TKL 1
    assert_eq!(wire[1], 0x45); // 2.05
    assert_eq!(&wire[2..4], &[0xBE, 0xEF]);
    assert_eq!(wire[4], 0x01);
    assert_eq!(wire[5], 0xC1); // Content-Format (delta 12), length 1
    assert_eq!(wire[6], 50);
    assert_eq!(wire[7], 0xFF);
    assert_eq!(&wire[8..], br#"{"echo":"hi"}"#);
}

// Option deltas and lengths at {12, 13, 268, 269, 65804} use header
// sizes {1, 2, 2, 3, 3} bytes.
#[test]
fn option_header_boundary_sizes() {
    for (number, header_len) in [
        (12u16, 1usize),
        (13, 2),
        (268, 2),
        (269, 3),
        (65535, 3),
    ] {
        let mut msg = Message::udp(MessageType::Con, c::METHOD_GET, 1, Vec::new());
        msg.options.insert(number, Vec::new());
        let wire = codec::udp::encode(&msg).unwrap();
        // 4 fixed header bytes, then the option header (no value bytes).
        assert_eq!(wire.len() - 4, header_len, "option number {}", number);
        assert_eq!(codec::udp::decode(&wire).unwrap(), msg, "option number {}", number);
    }

    for (length, header_len) in [
        (12usize, 1usize),
        (13, 2),
        (268, 2),
        (269, 3),
        (65535, 3),
    ] {
        let mut msg = Message::udp(MessageType::Con, c::METHOD_GET, 1, Vec::new());
        msg.options.insert(1, vec![0xAB; length]);
        let wire = codec::udp::encode(&msg).unwrap();
        assert_eq!(wire.len() - 4 - length, header_len, "value length {}", length);
        assert_eq!(codec::udp::decode(&wire).unwrap(), msg, "value length {}", length);
    }
}

#[test]
fn integer_option_minimality() {
    assert_eq!(uint_to_bytes(0), Vec::<u8>::new());
    assert_eq!(uint_to_bytes(8_388_864), vec![0x80, 0x01, 0x00]);
    assert_eq!(bytes_to_uint(&[0x80, 0x01, 0x00]), 8_388_864);
}

#[test]
fn tcp_frame_length_boundaries() {
    // Body lengths crossing every length-nibble encoding.
    for body_len in [0usize, 12, 13, 268, 269, 65804, 65805] {
        let mut msg = Message::tcp(c::METHOD_GET, vec![0x07]);
        if body_len > 0 {
            msg.payload = vec![0x55; body_len - 1]; // marker byte + payload
        }
        let wire = codec::tcp::encode(&msg).unwrap();
        let decoded = codec::tcp::decode(&wire).unwrap();
        assert_eq!(decoded, msg, "body length {}", body_len);
        assert_eq!(codec::tcp::encode(&decoded).unwrap(), wire);
    }
}

#[test]
fn tcp_csm_vector() {
    let mut csm = Message::tcp(c::SIGNAL_CSM, Vec::new());
    csm.options
        .insert_uint(c::CSM_OPT_MAX_MESSAGE_SIZE, 8_388_864);
    csm.options.insert(c::CSM_OPT_BLOCK_WISE_TRANSFER, Vec::new());
    let wire = codec::tcp::encode(&csm).unwrap();

    assert_eq!(
        wire,
        vec![
            0x50, // body length 5, TKL 0
            0xE1, // 7.01 CSM
            0x23, // Max-Message-Size (delta 2), length 3
            0x80, 0x01, 0x00, // 8_388_864 minimal
            0x20, // Block-Wise-Transfer (delta 2), zero length
        ]
    );
}

// Randomized structural round-trips over both framings. Seeded so a
// failure reproduces byte-for-byte.
#[test]
fn randomized_token_and_id_roundtrips() {
    fastrand::seed(0x7252);
    let option_numbers = [
        c::OPT_ETAG,
        c::OPT_URI_PATH,
        c::OPT_CONTENT_FORMAT,
        c::OPT_URI_QUERY,
        c::OPT_ACCEPT,
    ];

    for _ in 0..200 {
        let token: Vec<u8> = (0..fastrand::usize(0..=8)).map(|_| fastrand::u8(..)).collect();
        let mtype = if fastrand::bool() {
            MessageType::Con
        } else {
            MessageType::Non
        };
        let code = fastrand::u8(1..=4);

        let mut udp = Message::udp(mtype, code, fastrand::u16(..), token.clone());
        let mut tcp = Message::tcp(code, token);
        for _ in 0..fastrand::usize(0..4) {
            let number = option_numbers[fastrand::usize(..option_numbers.len())];
            let value: Vec<u8> = (0..fastrand::usize(0..16)).map(|_| fastrand::u8(..)).collect();
            udp.options.insert(number, value.clone());
            tcp.options.insert(number, value);
        }
        let payload: Vec<u8> = (0..fastrand::usize(0..32)).map(|_| fastrand::u8(..)).collect();
        udp.payload = payload.clone();
        tcp.payload = payload;

        let wire = codec::udp::encode(&udp).unwrap();
        assert_eq!(codec::udp::decode(&wire).unwrap(), udp);
        assert_eq!(codec::udp::encode(&udp).unwrap(), wire);

        let frame = codec::tcp::encode(&tcp).unwrap();
        assert_eq!(codec::tcp::decode(&frame).unwrap(), tcp);
        assert_eq!(codec::tcp::encode(&tcp).unwrap(), frame);
    }
}

#[test]
fn roundtrip_preserves_repeated_option_order() {
    let mut msg = Message::udp(MessageType::Non, c::METHOD_GET, 42, vec![0x09]);
    msg.set_path("/users/7/posts");
    msg.options.insert(c::OPT_URI_QUERY, b"b=2".to_vec());
    msg.options.insert(c::OPT_URI_QUERY, b"a=1".to_vec());

    let decoded = codec::udp::decode(&codec::udp::encode(&msg).unwrap()).unwrap();
    let queries = decoded.options.all(c::OPT_URI_QUERY);
    assert_eq!(queries, vec![&b"b=2"[..], &b"a=1"[..]]);
    assert_eq!(decoded.path(), "/users/7/posts");
}
