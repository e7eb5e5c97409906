//! The stateless components are shared freely between tasks.

use std::sync::Arc;

use tuyawire_protocol::{
    Cipher, CipherOptions, CloudRequest, Command, CommandData, DeviceIdentity, DeviceSession,
    DeviceType, LocalKey, PayloadCodec, Version,
};

const TOKEN_SIGNATURE: &str = "CD41BF8AA28892FCBA51A968AC074254F3B9C44F38809F4C70A15A98731624B8";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_signing_is_deterministic() {
    let request = Arc::new(
        CloudRequest::builder()
            .api_key("test_key_12345")
            .api_secret("test_secret_abcde")
            .timestamp(1_234_567_890_000)
            .method("GET")
            .url_path("/v1.0/token")
            .build()
            .unwrap(),
    );

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let request = Arc::clone(&request);
            tokio::spawn(async move { request.sign().unwrap() })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), TOKEN_SIGNATURE);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_codec_and_cipher() {
    let codec = Arc::new(PayloadCodec::new("shared_device", Version::V33, DeviceType::Default));
    let cipher = Arc::new(Cipher::from_key(LocalKey::from_material(b"test_key_1234567")));

    let handles: Vec<_> = (0..16u32)
        .map(|i| {
            let codec = Arc::clone(&codec);
            let cipher = Arc::clone(&cipher);
            tokio::spawn(async move {
                let data = CommandData::set_value(i + 1, i64::from(i));
                let body = codec.build(Command::Control, &data, 1_700_000_000).unwrap();
                let encrypted = cipher.encrypt(&body.body, &CipherOptions::ecb()).unwrap();
                let decrypted = cipher.decrypt(&encrypted, &CipherOptions::ecb()).unwrap();
                (data, codec.parse(body.command, &decrypted).unwrap())
            })
        })
        .collect();

    for handle in handles {
        let (sent, parsed) = handle.await.unwrap();
        assert_eq!(sent, parsed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_per_device_in_parallel() {
    let handles: Vec<_> = (0..8)
        .map(|i| {
            tokio::spawn(async move {
                let identity = DeviceIdentity::new(
                    format!("device_{}", i),
                    LocalKey::from_material(b"0123456789abcdef"),
                    Version::V35,
                );
                let mut session = DeviceSession::new(identity);
                let mut sequences = Vec::new();
                for _ in 0..10 {
                    let packet = session
                        .encode(Command::DpQuery, &CommandData::Empty, 1_700_000_000)
                        .unwrap();
                    sequences.push(packet.sequence);
                }
                sequences
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), (1..=10).collect::<Vec<u32>>());
    }
}
