use moderation_pipeline::catalog::{Catalog, FileCatalog};
use moderation_pipeline::engine::ModerationProvider;
use moderation_pipeline::table::{Column, ColumnType, Frame, TableSchema};
use moderation_pipeline::yandex_vision::{
    MODERATION_CATEGORIES, YandexCredentials, YandexVisionClient, YandexVisionConfig, default_record,
};
use moderation_pipeline::{CategoryValue, ImageClassificationStep, ModerationError};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve_images(server: &MockServer, count: usize) -> Vec<String> {
    let mut urls = Vec::new();
    for i in 0..count {
        let route = format!("/media/{i}.jpg");
        Mock::given(method("GET"))
            .and(path(route.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, i as u8]))
            .mount(server)
            .await;
        urls.push(format!("{}{}", server.uri(), route));
    }
    urls
}

fn classified(adult: f64) -> serde_json::Value {
    serde_json::json!({
        "results": [{
            "classification": {
                "properties": [
                    {"name": "adult", "probability": adult},
                    {"name": "gruesome", "probability": 0.02},
                    {"name": "text", "probability": 0.4},
                    {"name": "watermarks", "probability": 0.1}
                ]
            }
        }]
    })
}

fn config(server: &MockServer, credentials: YandexCredentials) -> YandexVisionConfig {
    YandexVisionConfig::new(credentials, "b1g-folder")
        .with_base_url(server.uri())
        .with_iam_url(server.uri())
}

#[tokio::test]
async fn oauth_token_is_exchanged_for_iam_token() {
    let server = MockServer::start().await;
    let images = serve_images(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/iam/v1/tokens"))
        .and(body_json(serde_json::json!({"yandexPassportOauthToken": "oauth-123"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "iamToken": "iam-456",
            "expiresAt": "2030-01-01T00:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/vision/v1/batchAnalyze"))
        .and(header("authorization", "Bearer iam-456"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [classified(0.9)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = YandexVisionClient::new(config(&server, YandexCredentials::OAuthToken("oauth-123".to_string())));
    let records = client.moderate_batch(&images).await.unwrap();

    assert_eq!(records[0].get("adult"), Some(&CategoryValue::Probability(0.9)));
    assert_eq!(records[0].get("text"), Some(&CategoryValue::Probability(0.4)));

    let requests = server.received_requests().await.unwrap();
    let analyze = requests
        .iter()
        .find(|r| r.url.path() == "/vision/v1/batchAnalyze")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&analyze.body).unwrap();
    assert_eq!(body["folderId"], "b1g-folder");
    assert_eq!(
        body["analyzeSpecs"][0]["features"][0]["classificationConfig"]["model"],
        "moderation"
    );
}

#[tokio::test]
async fn partial_response_fills_missing_positions_with_zero_records() {
    let server = MockServer::start().await;
    let images = serve_images(&server, 4).await;

    Mock::given(method("POST"))
        .and(path("/vision/v1/batchAnalyze"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [
                classified(0.3),
                {"error": {"code": 3, "message": "unsupported image"}},
                classified(0.8)
            ]
        })))
        .mount(&server)
        .await;

    let client = YandexVisionClient::new(config(&server, YandexCredentials::IamToken("iam".to_string())));
    let records = client.moderate_batch(&images).await.unwrap();

    assert_eq!(records.len(), 4);
    assert_eq!(records[0].get("adult"), Some(&CategoryValue::Probability(0.3)));
    assert_eq!(records[1], default_record());
    assert_eq!(records[2].get("adult"), Some(&CategoryValue::Probability(0.8)));
    assert_eq!(records[3], default_record());
    assert_eq!(
        records[3].to_json().to_string(),
        r#"{"adult":0,"gruesome":0,"text":0,"watermarks":0}"#
    );
}

#[tokio::test]
async fn api_key_uses_api_key_scheme() {
    let server = MockServer::start().await;
    let images = serve_images(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/vision/v1/batchAnalyze"))
        .and(header("authorization", "Api-Key ak-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = YandexVisionClient::new(config(&server, YandexCredentials::ApiKey("ak-1".to_string())));
    let records = client.moderate_batch(&images).await.unwrap();
    assert_eq!(records, vec![default_record()]);
}

#[tokio::test]
async fn more_than_five_images_is_rejected_before_any_request() {
    let server = MockServer::start().await;
    let images: Vec<String> = (0..6).map(|i| format!("{}/media/{i}.jpg", server.uri())).collect();

    let client = YandexVisionClient::new(config(&server, YandexCredentials::OAuthToken("oauth".to_string())));
    let err = client.moderate_batch(&images).await.unwrap_err();

    assert!(matches!(err, ModerationError::Validation { len: 6, max: 5, .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_iam_exchange_is_a_credentials_error() {
    let server = MockServer::start().await;
    let images = serve_images(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/iam/v1/tokens"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = YandexVisionClient::new(config(&server, YandexCredentials::OAuthToken("bad".to_string())));
    let err = client.moderate_batch(&images).await.unwrap_err();
    assert!(matches!(err, ModerationError::Credentials(_)));
}

#[tokio::test]
async fn step_writes_one_record_per_input_row() {
    let server = MockServer::start().await;
    let urls = serve_images(&server, 5).await;

    Mock::given(method("POST"))
        .and(path("/vision/v1/batchAnalyze"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [classified(0.1), classified(0.2), classified(0.3), classified(0.4), classified(0.5)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let catalog = FileCatalog::open(dir.path()).await.unwrap();
    catalog
        .create_or_get_table(
            "yd_image_urls_input",
            TableSchema::new(vec![
                Column::primary_key("image_id", ColumnType::String),
                Column::new("image_url", ColumnType::Json).not_null(),
            ]),
            true,
        )
        .await
        .unwrap();
    let ids: Vec<String> = (0..5).map(|_| uuid::Uuid::new_v4().to_string()).collect();
    let input = Frame::from_columns(vec![
        ("image_id".to_string(), ids.iter().map(|id| serde_json::json!(id)).collect()),
        ("image_url".to_string(), urls.iter().map(|u| serde_json::json!(u)).collect()),
    ])
    .unwrap();
    catalog.store_chunk("yd_image_urls_input", &input).await.unwrap();

    let step = ImageClassificationStep::yandex(
        "yd_image_urls_input",
        "yd_image_urls_output",
        config(&server, YandexCredentials::IamToken("iam".to_string())),
    )
    .with_step_name("image_classification_yandex_by_url");
    let compute = step.build_compute(&catalog).await.unwrap();
    assert_eq!(compute.chunk_size(), 5);
    compute.run(&catalog).await.unwrap();

    let reopened = FileCatalog::open(dir.path()).await.unwrap();
    let output = reopened.read("yd_image_urls_output").await.unwrap();
    assert_eq!(output.len(), 5);

    let mut got: Vec<String> = output
        .column("image_id")
        .unwrap()
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    got.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(got, expected);

    for details in output.column("details").unwrap() {
        let mut keys: Vec<_> = details.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, MODERATION_CATEGORIES.to_vec());
    }
}
