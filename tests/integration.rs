//! Upstream integration tests against mocked Azure services.
//!
//! No database or Redis needed: these exercise the HTTP clients directly
//! against `wiremock` servers.

mod upstream_tests {
    use ai_api_framework::proxy::upstream::UpstreamClient;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;
    use reqwest::Method;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_forward_relays_client_errors_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/gpt-4o/chat/completions"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":{"code":"BadRequest"}}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::new().unwrap();
        let url = format!("{}/openai/deployments/gpt-4o/chat/completions", server.uri());
        let resp = client
            .forward(Method::POST, &url, HeaderMap::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_forward_retries_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cognitiveservices/v1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cognitiveservices/v1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFF".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::with_retries(2).unwrap();
        let url = format!("{}/cognitiveservices/v1", server.uri());
        let resp = client
            .forward(Method::POST, &url, HeaderMap::new(), Bytes::from_static(b"<speak/>"))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"RIFF");
    }

    #[tokio::test]
    async fn test_post_form_encodes_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string("grant_type=client_credentials&scope=https%3A%2F%2Fx%2F.default"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::with_retries(0).unwrap();
        let resp = client
            .post_form(
                &format!("{}/token", server.uri()),
                &[("grant_type", "client_credentials"), ("scope", "https://x/.default")],
            )
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_an_error() {
        let client = UpstreamClient::with_retries(0).unwrap();
        // port 9 (discard) is closed on test hosts
        let err = client
            .forward(Method::GET, "http://127.0.0.1:9/", HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "upstream_failed");
    }
}

mod cost_management_tests {
    use ai_api_framework::config::CostConfig;
    use ai_api_framework::proxy::azure::CostManagementClient;
    use ai_api_framework::proxy::upstream::UpstreamClient;
    use chrono::NaiveDate;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QUERY_PATH: &str = "/subscriptions/sub-1/providers/Microsoft.CostManagement/query";

    fn cost_config(server: &MockServer) -> CostConfig {
        CostConfig {
            tenant_id: "tenant-1".into(),
            client_id: "client-1".into(),
            client_secret: "secret-1".into(),
            subscription_id: "sub-1".into(),
            login_url: server.uri(),
            management_url: server.uri(),
        }
    }

    fn cost_body() -> serde_json::Value {
        json!({
            "properties": {
                "columns": [
                    {"name": "Cost", "type": "Number"},
                    {"name": "ServiceName", "type": "String"},
                    {"name": "Currency", "type": "String"}
                ],
                "rows": [
                    [12.5, "Azure OpenAI", "USD"],
                    [3.25, "Cognitive Services", "USD"]
                ]
            }
        })
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[tokio::test]
    async fn test_query_costs_caches_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok-1", "expires_in": "3599"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .and(header("authorization", "Bearer tok-1"))
            .and(body_partial_json(json!({
                "type": "ActualCost",
                "timeframe": "Custom",
                "timePeriod": {"from": "2026-10-01T00:00:00Z", "to": "2026-10-15T23:59:59Z"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(cost_body()))
            .expect(2)
            .mount(&server)
            .await;

        let http = UpstreamClient::with_retries(0).unwrap();
        let client = CostManagementClient::new(cost_config(&server));

        let report = client.query_costs(&http, day(1), day(15)).await.unwrap();
        assert_eq!(report.columns, vec!["Cost", "ServiceName", "Currency"]);
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.rows[0][1], "Azure OpenAI");

        // second call reuses the cached bearer token
        client.query_costs(&http, day(1), day(15)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_query_drops_cached_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok-1", "expires_in": 3599})),
            )
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(cost_body()))
            .expect(1)
            .mount(&server)
            .await;

        let http = UpstreamClient::with_retries(0).unwrap();
        let client = CostManagementClient::new(cost_config(&server));

        let err = client.query_costs(&http, day(1), day(2)).await.unwrap_err();
        assert_eq!(err.code(), "upstream_failed");
        let report = client.query_costs(&http, day(1), day(2)).await.unwrap();
        assert_eq!(report.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_token_request_surfaces_as_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_client"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(cost_body()))
            .expect(0)
            .mount(&server)
            .await;

        let http = UpstreamClient::with_retries(0).unwrap();
        let client = CostManagementClient::new(cost_config(&server));
        let err = client.query_costs(&http, day(1), day(2)).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 502);
    }
}
