//! Generate test vectors for cross-implementation comparison.
//!
//! Prints one JSON document with cipher outputs, cloud signatures,
//! complete packets for every protocol version and bulb colour values. Diff it against the output
//! of another implementation fed the same inputs.
//!
//! Run with: cargo run --package tuyawire-protocol --example test_vectors
//! Set RUST_LOG=debug to trace every packet as it is built.

use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;
use tuyawire_protocol::cipher::{self, CipherOptions};
use tuyawire_protocol::color::{self, ColorFormat};
use tuyawire_protocol::{
    CloudRequest, Command, CommandData, DeviceIdentity, DeviceSession, LocalKey, Version,
};

const DEVICE_ID: &str = "test_device_id_001";
const LOCAL_KEY: &[u8] = b"test_key_1234567";
const SESSION_KEY: &[u8] = b"0123456789abcdef";
const NOW: u64 = 1_700_000_000;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut vectors = Map::new();
    vectors.insert("cipher".to_string(), cipher_vectors());
    vectors.insert("signatures".to_string(), signature_vectors());
    vectors.insert("packets".to_string(), packet_vectors());
    vectors.insert("colors".to_string(), color_vectors());

    let output = serde_json::to_string_pretty(&Value::Object(vectors))
        .expect("vectors serialize");
    println!("{}", output);
}

fn cipher_vectors() -> Value {
    let base64 = cipher::encrypt(
        b"Hello World",
        LOCAL_KEY,
        &CipherOptions::ecb().with_base64(true),
    )
    .expect("encrypt");
    let raw = cipher::encrypt(b"Hello World", LOCAL_KEY, &CipherOptions::ecb()).expect("encrypt");

    json!({
        "ecb_base64": String::from_utf8_lossy(&base64),
        "ecb_hex": hex::encode(raw),
    })
}

fn signature_vectors() -> Value {
    let base = || {
        CloudRequest::builder()
            .api_key("test_key_12345")
            .api_secret("test_secret_abcde")
            .timestamp(1_234_567_890_000)
    };
    let sign = |request: CloudRequest| request.sign().expect("sign");

    json!({
        "get_token_no_token": sign(
            base().method("GET").url_path("/v1.0/token").build().expect("request"),
        ),
        "get_devices_with_token": sign(
            base()
                .method("GET")
                .token("access_token_xyz")
                .url_path("/v1.0/iot-01/associated-users/devices")
                .build()
                .expect("request"),
        ),
        "post_command_with_body": sign(
            base()
                .method("POST")
                .token("access_token_xyz")
                .body(r#"{"commands":[{"code":"switch_1","value":true}]}"#)
                .header("Content-Type", "application/json")
                .header("Signature-Headers", "Content-Type")
                .url_path("/v1.0/iot-03/devices/test_device_id/commands")
                .build()
                .expect("request"),
        ),
        "get_with_query_params": sign(
            base()
                .method("GET")
                .token("access_token_xyz")
                .url_path("/v1.0/iot-01/associated-users/devices?size=100")
                .build()
                .expect("request"),
        ),
        "put_with_body": sign(
            base()
                .method("PUT")
                .token("access_token_xyz")
                .body(r#"{"name":"Updated Name"}"#)
                .header("Content-Type", "application/json")
                .header("Signature-Headers", "Content-Type")
                .url_path("/v1.0/devices/test_device_id")
                .build()
                .expect("request"),
        ),
    })
}

fn packet_vectors() -> Value {
    let session = |version: Version, sequence: u32| {
        let identity =
            DeviceIdentity::new(DEVICE_ID, LocalKey::from_material(LOCAL_KEY), version);
        let mut session = DeviceSession::new(identity).with_initial_sequence(sequence);
        if version.is_negotiated() {
            session.install_session_key(LocalKey::from_material(SESSION_KEY));
        }
        session.with_nonce_seed([0x00, 0x01, 0x02, 0x03], 0x0405_0607_0809_0a0b)
    };
    let control = CommandData::set_value(1, true);

    let mut packets = Map::new();
    for (version, sequence) in [
        (Version::V31, 1),
        (Version::V33, 1),
        (Version::V34, 3),
        (Version::V35, 4),
    ] {
        let packet = session(version, sequence)
            .encode(Command::Control, &control, NOW)
            .expect("encode");
        packets.insert(
            format!("control_v{}", version.as_str().replace('.', "")),
            json!(hex::encode(packet.bytes)),
        );
    }

    let heart_beat = session(Version::V33, 2)
        .encode(Command::HeartBeat, &CommandData::Empty, NOW)
        .expect("encode");
    packets.insert(
        "heart_beat_v33".to_string(),
        json!(hex::encode(heart_beat.bytes)),
    );

    Value::Object(packets)
}

fn color_vectors() -> Value {
    let mut colors = Map::new();
    for (name, (r, g, b)) in [
        ("red", (255, 0, 0)),
        ("green", (0, 255, 0)),
        ("blue", (0, 0, 255)),
        ("white", (255, 255, 255)),
        ("mixed", (128, 64, 200)),
    ] {
        for format in [ColorFormat::Rgb8, ColorFormat::Hsv16] {
            colors.insert(
                format!("rgb_to_hex_{}_{}", format, name),
                json!(color::rgb_to_hexvalue(r, g, b, format)),
            );
        }
    }
    for (i, h) in [0.0, 0.33, 0.66].into_iter().enumerate() {
        colors.insert(
            format!("hsv_to_hex_hsv16_{}", i + 1),
            json!(color::hsv_to_hexvalue(h, 1.0, 1.0, ColorFormat::Hsv16)),
        );
    }
    for (name, value, format) in [
        ("rgb8", "ff0000", Some(ColorFormat::Rgb8)),
        ("hsv16", "000003e803e8", Some(ColorFormat::Hsv16)),
        ("auto_6", "00ff00", None),
        ("auto_12", "007803e803e8", None),
        ("auto_14", "0000ff00f0ffff", None),
    ] {
        let (r, g, b) = color::hexvalue_to_rgb(value, format).expect("colour");
        let (h, s, v) = color::hexvalue_to_hsv(value, format).expect("colour");
        colors.insert(format!("hex_to_rgb_{}", name), json!([r, g, b]));
        colors.insert(format!("hex_to_hsv_{}", name), json!([h, s, v]));
    }
    Value::Object(colors)
}
