//! HTTP identity service client.

use crate::IdentityService;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use visitor_core::{
    AuthState, ConfigError, IdentityRecord, ServiceError, ServiceResult, VisitorConfig,
    VisitorResult, API_VERSION, DATA_PROVIDER_ID_SEPARATOR, QP_DATA_PROVIDER_ID,
    QP_EXPERIENCE_CLOUD_ID, QP_ORG_ID, QP_VERSION,
};

/// Identity payload as returned by the service.
#[derive(Debug, Deserialize)]
struct IdentityResponse {
    d_mid: Option<String>,
    id_sync_ttl: Option<i64>,
    dcs_region: Option<i32>,
    d_blob: Option<String>,
}

/// reqwest-backed [`IdentityService`].
pub struct HttpIdentityService {
    client: Client,
    base_url: Url,
    org_id: String,
}

impl HttpIdentityService {
    /// Create a client for `org_id` against `service_url`.
    pub fn new(
        org_id: impl Into<String>,
        service_url: &str,
        timeout: std::time::Duration,
    ) -> VisitorResult<Self> {
        let base_url = Url::parse(service_url).map_err(|e| ConfigError::InvalidValue {
            field: "service_url".to_string(),
            value: service_url.to_string(),
            reason: e.to_string(),
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::NotConnected {
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url,
            org_id: org_id.into(),
        })
    }

    pub fn from_config(config: &VisitorConfig) -> VisitorResult<Self> {
        Self::new(
            config.org_id.clone(),
            &config.service_url,
            config.request_timeout(),
        )
    }

    /// URL for a request carrying the common parameters plus `extra`.
    fn request_url(&self, extra: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair(QP_ORG_ID, &self.org_id);
            pairs.append_pair(QP_VERSION, &API_VERSION.to_string());
            for (key, value) in extra {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    pub(crate) fn new_url(&self) -> Url {
        self.request_url(&[])
    }

    pub(crate) fn refresh_url(&self, current_id: &str) -> Url {
        self.request_url(&[(QP_EXPERIENCE_CLOUD_ID, current_id)])
    }

    pub(crate) fn link_url(
        &self,
        known_id: &str,
        current_id: &str,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
    ) -> Url {
        let cid = generate_cid(data_provider_id, known_id, auth_state);
        self.request_url(&[(QP_EXPERIENCE_CLOUD_ID, current_id), (QP_DATA_PROVIDER_ID, &cid)])
    }

    async fn send(&self, url: Url) -> ServiceResult<IdentityRecord> {
        tracing::debug!(url = %url, "Sending identity request");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_connect() {
                ServiceError::NotConnected {
                    reason: e.to_string(),
                }
            } else {
                ServiceError::RequestFailed {
                    status: e.status().map(|s| s.as_u16() as i32).unwrap_or(0),
                    message: format!("HTTP request failed: {}", e),
                }
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| ServiceError::RequestFailed {
            status: status.as_u16() as i32,
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "Identity request rejected");
            return Err(ServiceError::RequestFailed {
                status: status.as_u16() as i32,
                message: body,
            });
        }

        parse_identity_response(&body)
    }
}

/// Join the link triple with the data provider separator.
pub(crate) fn generate_cid(
    data_provider_id: i64,
    known_id: &str,
    auth_state: Option<AuthState>,
) -> String {
    let auth = auth_state.unwrap_or_default().code();
    format!(
        "{}{sep}{}{sep}{}",
        data_provider_id,
        known_id,
        auth,
        sep = DATA_PROVIDER_ID_SEPARATOR
    )
}

/// Turn a response body into a record.
pub fn parse_identity_response(body: &str) -> ServiceResult<IdentityRecord> {
    let response: IdentityResponse =
        serde_json::from_str(body).map_err(|e| ServiceError::InvalidResponse {
            reason: format!("Failed to parse response: {}", e),
        })?;

    let missing = |field: &str| ServiceError::InvalidIdentityPayload {
        reason: format!("missing or empty {}", field),
    };

    let id = response
        .d_mid
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing(QP_EXPERIENCE_CLOUD_ID))?;
    let ttl = response.id_sync_ttl.ok_or_else(|| missing("id_sync_ttl"))?;
    let region = response.dcs_region.ok_or_else(|| missing("dcs_region"))?;
    let blob = response.d_blob.ok_or_else(|| missing("d_blob"))?;

    Ok(IdentityRecord::from_service(id, ttl, region, blob))
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn request_new(&self) -> ServiceResult<IdentityRecord> {
        self.send(self.new_url()).await
    }

    async fn request_new_and_link(
        &self,
        known_id: &str,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
    ) -> ServiceResult<IdentityRecord> {
        let fresh = self.request_new().await?;
        self.link_known_identifier(known_id, &fresh.id, data_provider_id, auth_state)
            .await
    }

    async fn refresh_existing(&self, current_id: &str) -> ServiceResult<IdentityRecord> {
        self.send(self.refresh_url(current_id)).await
    }

    async fn link_known_identifier(
        &self,
        known_id: &str,
        current_id: &str,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
    ) -> ServiceResult<IdentityRecord> {
        let url = self.link_url(known_id, current_id, data_provider_id, auth_state);
        self.send(url).await
    }

    fn name(&self) -> &str {
        "http"
    }
}

impl std::fmt::Debug for HttpIdentityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityService")
            .field("base_url", &self.base_url.as_str())
            .field("org_id", &self.org_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use visitor_core::{ErrorKind, VisitorError, DEFAULT_SERVICE_URL};

    fn service() -> HttpIdentityService {
        HttpIdentityService::new("orgId", DEFAULT_SERVICE_URL, Duration::from_secs(1))
            .expect("client should build")
    }

    #[test]
    fn test_new_url() {
        assert_eq!(
            service().new_url().as_str(),
            "https://dpm.demdex.net/id?d_orgid=orgId&d_ver=2"
        );
    }

    #[test]
    fn test_refresh_url() {
        assert_eq!(
            service().refresh_url("ecid").as_str(),
            "https://dpm.demdex.net/id?d_orgid=orgId&d_ver=2&d_mid=ecid"
        );
    }

    #[test]
    fn test_link_url_defaults_auth_state() {
        assert_eq!(
            service().link_url("knownId", "ecid", 1, None).as_str(),
            "https://dpm.demdex.net/id?d_orgid=orgId&d_ver=2&d_mid=ecid&d_cid=1%01knownId%010"
        );
    }

    #[test]
    fn test_link_url_with_auth_state() {
        let url = service().link_url("knownId", "ecid", 1, Some(AuthState::Authenticated));
        assert_eq!(
            url.as_str(),
            "https://dpm.demdex.net/id?d_orgid=orgId&d_ver=2&d_mid=ecid&d_cid=1%01knownId%011"
        );
    }

    #[test]
    fn test_invalid_service_url_rejected() {
        let err = HttpIdentityService::new("orgId", "not a url", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, VisitorError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_parse_valid_response() {
        let record = parse_identity_response(
            r#"{"d_mid": "ecid", "dcs_region": 6, "id_sync_ttl": 100, "d_blob": "blob"}"#,
        )
        .unwrap();
        assert_eq!(record.id, "ecid");
        assert_eq!(record.region, Some(6));
        assert_eq!(record.id_sync_ttl, Some(100));
        assert_eq!(record.blob, "blob");
        assert_eq!(record.data_provider_id, None);
    }

    #[test]
    fn test_parse_missing_fields() {
        let bodies = [
            r#"{"dcs_region": 6, "id_sync_ttl": 100, "d_blob": "blob"}"#,
            r#"{"d_mid": "", "dcs_region": 6, "id_sync_ttl": 100, "d_blob": "blob"}"#,
            r#"{"d_mid": "ecid", "id_sync_ttl": 100, "d_blob": "blob"}"#,
            r#"{"d_mid": "ecid", "dcs_region": 6, "d_blob": "blob"}"#,
            r#"{"d_mid": "ecid", "dcs_region": 6, "id_sync_ttl": 100}"#,
        ];
        for body in bodies {
            let err = parse_identity_response(body).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidIdentityPayload, "body: {}", body);
        }
    }

    #[test]
    fn test_parse_malformed_json() {
        let err = parse_identity_response("<html>oops</html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }

    #[test]
    fn test_parse_wrong_field_type() {
        let err = parse_identity_response(r#"{"d_mid": 12, "dcs_region": 6}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_not_connected() {
        let service =
            HttpIdentityService::new("orgId", "http://127.0.0.1:1/id", Duration::from_secs(1))
                .unwrap();
        let err = service.request_new().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The cid always splits back into its three parts.
        #[test]
        fn prop_cid_has_three_parts(
            dpid in 0i64..1_000_000i64,
            known in "[a-zA-Z0-9@._-]{1,30}",
            code in 0i32..3i32,
        ) {
            let cid = generate_cid(dpid, &known, AuthState::from_code(code));
            let parts: Vec<String> = cid.split(DATA_PROVIDER_ID_SEPARATOR).map(String::from).collect();
            prop_assert_eq!(parts, vec![dpid.to_string(), known, code.to_string()]);
        }
    }
}
