//! Frozen wire-format compatibility tests.
//!
//! These pin the JSON produced/accepted by the v1 protocol so refactors
//! cannot silently change the envelope shape or field casing.

use wv_protocol::{
    ClientMessage, DrawRequest, DrawResponse, KeyEnvelope, KeysUpdated, Layer, PageRef, Provider,
    PurgeJob, ServerMessage, Stroke, StrokeEvent, UndoRequest, parse_layer_tag, private_layer_tag,
};

#[test]
fn client_envelope_uses_type_and_data() {
    let msg = ClientMessage::Load(PageRef {
        page_key: "example.com/a".to_owned(),
        layer: Layer::Public,
        layer_id: String::new(),
    });
    let value = serde_json::to_value(&msg).expect("serialize load");
    assert_eq!(value["type"], "load");
    assert_eq!(value["data"]["pageKey"], "example.com/a");
    assert_eq!(value["data"]["layer"], 0);
}

#[test]
fn layer_round_trips_as_integer() {
    assert_eq!(serde_json::to_value(Layer::Public).unwrap(), 0);
    assert_eq!(serde_json::to_value(Layer::Private).unwrap(), 1);
    assert_eq!(serde_json::from_value::<Layer>(1.into()).unwrap(), Layer::Private);
    assert!(serde_json::from_value::<Layer>(2.into()).is_err());
}

#[test]
fn draw_request_parses_with_empty_id_and_defaults() {
    let json = r#"{
        "type": "draw",
        "data": {
            "stroke": {"content": "e30="},
            "pageKey": "example.com/a",
            "userStrokeId": 7,
            "layer": 0
        }
    }"#;
    let msg: ClientMessage = serde_json::from_str(json).expect("draw should parse");
    match msg {
        ClientMessage::Draw(DrawRequest { stroke, user_stroke_id, .. }) => {
            assert!(stroke.id.is_empty());
            assert!(stroke.user_id.is_empty());
            assert!(stroke.nonce.is_empty());
            assert_eq!(user_stroke_id, 7);
        }
        other => panic!("expected draw, got {other:?}"),
    }
}

#[test]
fn undo_request_field_casing() {
    let msg = ClientMessage::Undo(UndoRequest {
        page_key: "example.com/a".to_owned(),
        layer: Layer::Private,
        layer_id: "5".to_owned(),
        stroke_id: "0191b6a1-0000-7000-8000-000000000000".to_owned(),
    });
    let value = serde_json::to_value(&msg).expect("serialize undo");
    assert_eq!(value["type"], "undo");
    assert_eq!(value["data"]["layerId"], "5");
    assert_eq!(value["data"]["strokeId"], "0191b6a1-0000-7000-8000-000000000000");
}

#[test]
fn draw_response_omits_absent_fields() {
    let ok = ServerMessage::DrawResponse(DrawResponse {
        success: true,
        error: None,
        page_key: "example.com/a".to_owned(),
        user_stroke_id: 1,
        layer: Layer::Public,
        layer_id: String::new(),
        stroke_id: Some("0191b6a1-0000-7000-8000-000000000000".to_owned()),
    });
    let value = serde_json::to_value(&ok).expect("serialize draw_response");
    assert_eq!(value["type"], "draw_response");
    assert!(value["data"].get("error").is_none());
    assert_eq!(value["data"]["success"], true);

    let failed = ServerMessage::DrawResponse(DrawResponse {
        success: false,
        error: Some("PageQuotaExceeded".to_owned()),
        page_key: "example.com/a".to_owned(),
        user_stroke_id: 1,
        layer: Layer::Public,
        layer_id: String::new(),
        stroke_id: None,
    });
    let value = serde_json::to_value(&failed).expect("serialize failed draw_response");
    assert_eq!(value["data"]["error"], "PageQuotaExceeded");
    assert!(value["data"].get("strokeId").is_none());
}

#[test]
fn push_frames_use_snake_case_types() {
    let push = ServerMessage::NewStroke(StrokeEvent {
        page_key: "example.com/a".to_owned(),
        layer: Layer::Public,
        layer_id: String::new(),
        stroke: Stroke {
            id: "0191b6a1-0000-7000-8000-000000000000".to_owned(),
            user_id: "u-1".to_owned(),
            nonce: String::new(),
            content: "e30=".to_owned(),
        },
    });
    let text = serde_json::to_string(&push).expect("serialize new_stroke");
    let value: serde_json::Value = serde_json::from_str(&text).expect("parse back");
    assert_eq!(value["type"], "new_stroke");
    assert_eq!(value["data"]["stroke"]["userId"], "u-1");

    let keys = ServerMessage::KeysUpdated(KeysUpdated { key_version: 6, keys_deleted: false });
    let value = serde_json::to_value(&keys).expect("serialize keys_updated");
    assert_eq!(value["type"], "keys_updated");
    assert_eq!(value["data"]["keyVersion"], 6);
    assert_eq!(value["data"]["keysDeleted"], false);
}

#[test]
fn key_envelope_uses_dek_field_names() {
    let envelope = KeyEnvelope {
        salt_kek: "c2FsdA==".to_owned(),
        encrypted_dek1: "ZGVrMQ==".to_owned(),
        nonce_dek1: "bm9uY2Ux".to_owned(),
        encrypted_dek2: "ZGVrMg==".to_owned(),
        nonce_dek2: "bm9uY2Uy".to_owned(),
    };
    let value = serde_json::to_value(&envelope).expect("serialize envelope");
    assert_eq!(value["saltKEK"], "c2FsdA==");
    assert_eq!(value["encryptedDEK1"], "ZGVrMQ==");
    assert_eq!(value["nonceDEK2"], "bm9uY2Uy");
}

#[test]
fn purge_job_round_trip_and_layer_tags() {
    let job = PurgeJob {
        user_id: "u-1".to_owned(),
        provider: Provider::Github,
        provider_id: "9000".to_owned(),
        delete_all: false,
        layer: Some(private_layer_tag(4)),
    };
    let text = serde_json::to_string(&job).expect("serialize purge job");
    let parsed: PurgeJob = serde_json::from_str(&text).expect("parse purge job");
    assert_eq!(parsed, job);

    assert_eq!(parse_layer_tag("Private#4"), Some((Layer::Private, "4".to_owned())));
    assert_eq!(parse_layer_tag("Public"), Some((Layer::Public, String::new())));
    assert_eq!(parse_layer_tag("garbage"), None);
}

#[test]
fn unknown_client_type_is_rejected() {
    let json = r#"{"type": "shout", "data": {}}"#;
    assert!(serde_json::from_str::<ClientMessage>(json).is_err());
}
