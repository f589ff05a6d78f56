// Parking rules client for the city transit API.
// Fetches the rules around a coordinate with bounded retries and reduces the nested
// upstream payload to a map of address -> readable rule sentences.

use crate::config::{ConfigError, ParkingRulesConfig};
use crate::transport::{HttpTransport, ReqwestTransport, TransportError};
use async_trait::async_trait;
use reqwest::{Method, Request, Url};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const RULES_PATH: &str = "/transito/v1/estacionamientos";

// Address ("<street> <number>") -> rule sentences in the order upstream returned them
pub type SimplifiedRules = BTreeMap<String, Vec<String>>;

#[derive(Error, Debug)]
pub enum ParkingRulesError {
    #[error("error creating request for {endpoint}: {reason}")]
    RequestBuild { endpoint: String, reason: String },

    #[error("error decoding parking rules response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no parking rules found")]
    NoRulesFound { attempts: Vec<AttemptFailure> },
}

impl ParkingRulesError {
    pub fn is_no_rules_found(&self) -> bool {
        matches!(self, ParkingRulesError::NoRulesFound { .. })
    }
}

// Why a single attempt did not produce rules
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    #[error("transport failed: {0}")]
    Transport(TransportError),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("empty response body")]
    EmptyBody,

    #[error("no location instances in response")]
    NoInstances,
}

// Wire format of the upstream response.
// Upstream sends null for empty values; missing and null fields both read as empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ParkingRulesResponse {
    #[serde(rename = "totalFull", deserialize_with = "null_as_default")]
    pub total_full: i64,
    #[serde(rename = "instancias", deserialize_with = "null_as_default")]
    pub instances: Vec<ParkingRuleInstance>,
    #[serde(deserialize_with = "null_as_default")]
    pub total: i64,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ParkingRuleInstance {
    #[serde(rename = "nombre", deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "claseId", deserialize_with = "null_as_default")]
    pub class_id: String,
    #[serde(rename = "clase", deserialize_with = "null_as_default")]
    pub class: String,
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(rename = "distancia", deserialize_with = "null_as_default")]
    pub distance: String,
    #[serde(rename = "contenido", deserialize_with = "null_as_default")]
    pub content: RuleContent,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct RuleContent {
    #[serde(rename = "contenido", deserialize_with = "null_as_default")]
    pub details: Vec<RuleDetail>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct RuleDetail {
    #[serde(rename = "nombreId", deserialize_with = "null_as_default")]
    pub field_key: String,
    #[serde(rename = "nombre", deserialize_with = "null_as_default")]
    pub field_label: String,
    #[serde(rename = "posicion", deserialize_with = "null_as_default")]
    pub position: String,
    #[serde(rename = "valor", deserialize_with = "null_as_default")]
    pub value: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// The only detail keys that feed into a rule sentence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleField {
    Street,
    Number,
    Permission,
    Schedule,
    Side,
    Parity,
}

impl RuleField {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "calle" => Some(RuleField::Street),
            "altura" => Some(RuleField::Number),
            "permiso" => Some(RuleField::Permission),
            "horario" => Some(RuleField::Schedule),
            "lado" => Some(RuleField::Side),
            "paridad" => Some(RuleField::Parity),
            _ => None,
        }
    }
}

impl ParkingRuleInstance {
    // Later details win when upstream repeats a key
    fn recognized_fields(&self) -> HashMap<RuleField, &str> {
        self.content
            .details
            .iter()
            .filter_map(|detail| {
                RuleField::from_key(&detail.field_key).map(|field| (field, detail.value.as_str()))
            })
            .collect()
    }
}

pub fn simplify_rules(instances: &[ParkingRuleInstance]) -> SimplifiedRules {
    let mut rules = SimplifiedRules::new();

    for instance in instances {
        let fields = instance.recognized_fields();
        let field = |name: RuleField| fields.get(&name).copied().unwrap_or_default();

        let address = format!("{} {}", field(RuleField::Street), field(RuleField::Number))
            .trim()
            .to_string();

        let sentence = match field(RuleField::Parity) {
            "" => format!(
                "Lado {}: {} las {}.",
                field(RuleField::Side),
                field(RuleField::Permission),
                field(RuleField::Schedule)
            ),
            parity => format!(
                "Lado {} ({}): {} las {}.",
                field(RuleField::Side),
                parity,
                field(RuleField::Permission),
                field(RuleField::Schedule)
            ),
        };

        rules
            .entry(address)
            .or_default()
            .push(sentence_case(&sentence));
    }

    rules
}

// Lower-cases everything, then capitalizes only the first character
fn sentence_case(text: &str) -> String {
    let lower = text.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// What request handlers depend on
#[async_trait]
pub trait ParkingRulesApi: Send + Sync + 'static {
    async fn parking_rules(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<SimplifiedRules, ParkingRulesError>;
}

pub struct ParkingRulesClient {
    config: ParkingRulesConfig,
    transport: Arc<dyn HttpTransport>,
}

impl ParkingRulesClient {
    pub fn new(
        config: ParkingRulesConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, transport })
    }

    // Client over a real HTTP transport using the configured timeout
    pub fn with_default_transport(config: ParkingRulesConfig) -> Result<Self, ConfigError> {
        let transport = ReqwestTransport::new(config.timeout())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &ParkingRulesConfig {
        &self.config
    }

    // Upstream names the axes x = longitude, y = latitude
    pub fn rules_url(&self, latitude: f64, longitude: f64) -> Result<Url, ParkingRulesError> {
        let endpoint = format!("{}{}", self.config.base_url.trim_end_matches('/'), RULES_PATH);
        let build_error = |reason: String| ParkingRulesError::RequestBuild {
            endpoint: endpoint.clone(),
            reason,
        };

        let params = [
            ("client_id", self.config.client_id.clone()),
            ("client_secret", self.config.client_secret.clone()),
            ("x", format!("{:.6}", longitude)),
            ("y", format!("{:.6}", latitude)),
            ("radio", self.config.search_radius_m.to_string()),
            ("formato", "json".to_string()),
            ("fullInfo", "true".to_string()),
        ];

        let url = Url::parse_with_params(&endpoint, &params)
            .map_err(|e| build_error(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(build_error(format!("unsupported scheme {}", url.scheme())));
        }

        Ok(url)
    }

    pub async fn fetch_rules(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<SimplifiedRules, ParkingRulesError> {
        let url = self.rules_url(latitude, longitude)?;
        let retry = &self.config.retry_config;
        let mut failures = Vec::new();
        let mut response = None;

        for attempt in 1..=retry.max_attempts {
            if attempt > 1 {
                let delay = retry.backoff_for(attempt - 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            match self
                .transport
                .execute(Request::new(Method::GET, url.clone()))
                .await
            {
                Ok(resp) if resp.is_ok() => {
                    response = Some(resp);
                    break;
                }
                Ok(resp) => {
                    warn!(attempt, status = resp.status, "parking rules request rejected");
                    failures.push(AttemptFailure::UnexpectedStatus(resp.status));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "parking rules request failed");
                    failures.push(AttemptFailure::Transport(e));
                }
            }
        }

        let Some(response) = response else {
            return Err(ParkingRulesError::NoRulesFound { attempts: failures });
        };

        if response.body.is_empty() {
            failures.push(AttemptFailure::EmptyBody);
            return Err(ParkingRulesError::NoRulesFound { attempts: failures });
        }

        let decoded: ParkingRulesResponse = serde_json::from_slice(&response.body)?;
        if decoded.instances.is_empty() {
            failures.push(AttemptFailure::NoInstances);
            return Err(ParkingRulesError::NoRulesFound { attempts: failures });
        }

        let rules = simplify_rules(&decoded.instances);
        debug!(
            instances = decoded.instances.len(),
            addresses = rules.len(),
            retries = failures.len(),
            "parking rules fetched"
        );
        Ok(rules)
    }
}

#[async_trait]
impl ParkingRulesApi for ParkingRulesClient {
    async fn parking_rules(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<SimplifiedRules, ParkingRulesError> {
        self.fetch_rules(latitude, longitude).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::transport::mock_transport::ScriptedTransport;
    use crate::transport::TransportResponse;
    use serde_json::{json, Value};
    use tokio_test::{assert_err, assert_ok};

    const LAT: f64 = -34.603722;
    const LON: f64 = -58.381592;

    fn detail(key: &str, value: &str) -> Value {
        json!({ "nombreId": key, "nombre": key, "posicion": "1", "valor": value })
    }

    fn instance(details: Vec<Value>) -> Value {
        json!({
            "nombre": "Test Rule",
            "claseId": "1",
            "clase": "Test Class",
            "id": "123",
            "distancia": "100",
            "contenido": { "contenido": details }
        })
    }

    fn corrientes(extra: Vec<Value>) -> Value {
        let mut details = vec![
            detail("calle", "Corrientes"),
            detail("altura", "1000"),
            detail("permiso", "Permitido"),
            detail("horario", "08:00-20:00"),
            detail("lado", "Izquierdo"),
        ];
        details.extend(extra);
        instance(details)
    }

    fn body(instances: Vec<Value>) -> String {
        let total = instances.len();
        json!({ "totalFull": total, "instancias": instances, "total": total }).to_string()
    }

    fn ok(instances: Vec<Value>) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(200, body(instances)))
    }

    fn network_error() -> Result<TransportResponse, TransportError> {
        Err(TransportError::Network("connection refused".to_string()))
    }

    fn client_with(transport: &Arc<ScriptedTransport>) -> ParkingRulesClient {
        let config = ParkingRulesConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            ..ParkingRulesConfig::default()
        };
        ParkingRulesClient::new(config, transport.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_rules_ok() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(vec![corrientes(vec![])])]));
        let client = client_with(&transport);

        let rules = assert_ok!(client.fetch_rules(LAT, LON).await);

        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules["Corrientes 1000"],
            vec!["Lado izquierdo: permitido las 08:00-20:00."]
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_rules_with_parity() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(vec![corrientes(vec![
            detail("paridad", "Impar"),
        ])])]));
        let client = client_with(&transport);

        let rules = assert_ok!(client.fetch_rules(LAT, LON).await);

        assert_eq!(
            rules["Corrientes 1000"],
            vec!["Lado izquierdo (impar): permitido las 08:00-20:00."]
        );
    }

    #[tokio::test]
    async fn test_request_shape() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(vec![corrientes(vec![])])]));
        let client = client_with(&transport);

        assert_ok!(client.fetch_rules(LAT, LON).await);

        let urls = transport.requested_urls();
        assert_eq!(urls.len(), 1);
        let url = &urls[0];
        assert_eq!(url.host_str(), Some("apitransporte.buenosaires.gob.ar"));
        assert_eq!(url.path(), RULES_PATH);

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query["client_id"], "id");
        assert_eq!(query["client_secret"], "secret");
        assert_eq!(query["x"], "-58.381592");
        assert_eq!(query["y"], "-34.603722");
        assert_eq!(query["radio"], "100");
        assert_eq!(query["formato"], "json");
        assert_eq!(query["fullInfo"], "true");
    }

    #[tokio::test]
    async fn test_zero_instances_is_no_rules_found() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(vec![])]));
        let client = client_with(&transport);

        let err = assert_err!(client.fetch_rules(LAT, LON).await);

        assert!(err.is_no_rules_found());
        assert_eq!(err.to_string(), "no parking rules found");
        match err {
            ParkingRulesError::NoRulesFound { attempts } => {
                assert_eq!(attempts, vec![AttemptFailure::NoInstances])
            }
            other => panic!("expected NoRulesFound, got {other:?}"),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_null_instances_is_no_rules_found() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(TransportResponse::new(
            200,
            r#"{"totalFull":0,"instancias":null,"total":0}"#,
        ))]));
        let client = client_with(&transport);

        let err = assert_err!(client.fetch_rules(LAT, LON).await);
        match err {
            ParkingRulesError::NoRulesFound { attempts } => {
                assert_eq!(attempts, vec![AttemptFailure::NoInstances])
            }
            other => panic!("expected NoRulesFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_null_unused_fields_still_produce_rules() {
        let mut rule = corrientes(vec![]);
        rule["distancia"] = Value::Null;
        rule["id"] = Value::Null;
        rule["contenido"]["contenido"][0]["posicion"] = Value::Null;
        rule["contenido"]["contenido"][1]["nombre"] = Value::Null;
        let transport = Arc::new(ScriptedTransport::new(vec![ok(vec![rule])]));
        let client = client_with(&transport);

        let rules = assert_ok!(client.fetch_rules(LAT, LON).await);
        assert_eq!(
            rules["Corrientes 1000"],
            vec!["Lado izquierdo: permitido las 08:00-20:00."]
        );
    }

    #[test]
    fn test_null_value_reads_as_empty() {
        let mut rule = corrientes(vec![]);
        rule["contenido"]["contenido"][1]["valor"] = Value::Null;

        let rules = simplify_rules(&parse_instances(vec![rule]));
        assert!(rules.contains_key("Corrientes"));
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            network_error(),
            network_error(),
            ok(vec![corrientes(vec![])]),
        ]));
        let client = client_with(&transport);

        let rules = assert_ok!(client.fetch_rules(LAT, LON).await);

        assert!(rules.contains_key("Corrientes 1000"));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_all_attempts_fail() {
        let transport = Arc::new(ScriptedTransport::always(network_error(), 5));
        let client = client_with(&transport);

        let err = assert_err!(client.fetch_rules(LAT, LON).await);

        match err {
            ParkingRulesError::NoRulesFound { attempts } => {
                assert_eq!(attempts.len(), 3);
                assert!(attempts
                    .iter()
                    .all(|a| matches!(a, AttemptFailure::Transport(TransportError::Network(_)))));
            }
            other => panic!("expected NoRulesFound, got {other:?}"),
        }
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_non_200_statuses_are_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(TransportResponse::new(500, "")),
            Ok(TransportResponse::new(404, "")),
            Ok(TransportResponse::new(503, "")),
            ok(vec![corrientes(vec![])]),
        ]));
        let client = client_with(&transport);

        let err = assert_err!(client.fetch_rules(LAT, LON).await);

        match err {
            ParkingRulesError::NoRulesFound { attempts } => assert_eq!(
                attempts,
                vec![
                    AttemptFailure::UnexpectedStatus(500),
                    AttemptFailure::UnexpectedStatus(404),
                    AttemptFailure::UnexpectedStatus(503),
                ]
            ),
            other => panic!("expected NoRulesFound, got {other:?}"),
        }
        // The fourth scripted response is never requested
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_bound_is_configurable() {
        let transport = Arc::new(ScriptedTransport::always(network_error(), 5));
        let config = ParkingRulesConfig {
            retry_config: RetryConfig {
                max_attempts: 5,
                ..RetryConfig::default()
            },
            ..ParkingRulesConfig::default()
        };
        let client = ParkingRulesClient::new(config, transport.clone()).unwrap();

        assert_err!(client.fetch_rules(LAT, LON).await);
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test]
    async fn test_empty_body_is_no_rules_found() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(TransportResponse::new(
            200, "",
        ))]));
        let client = client_with(&transport);

        let err = assert_err!(client.fetch_rules(LAT, LON).await);
        match err {
            ParkingRulesError::NoRulesFound { attempts } => {
                assert_eq!(attempts, vec![AttemptFailure::EmptyBody])
            }
            other => panic!("expected NoRulesFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(TransportResponse::new(
            200,
            "<html>maintenance</html>",
        ))]));
        let client = client_with(&transport);

        let err = assert_err!(client.fetch_rules(LAT, LON).await);
        assert!(matches!(err, ParkingRulesError::Decode(_)));
    }

    #[tokio::test]
    async fn test_bad_base_url_is_request_build_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let config = ParkingRulesConfig {
            base_url: "not a url".to_string(),
            ..ParkingRulesConfig::default()
        };
        let client = ParkingRulesClient::new(config, transport.clone()).unwrap();

        let err = assert_err!(client.fetch_rules(LAT, LON).await);
        assert!(matches!(err, ParkingRulesError::RequestBuild { .. }));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_works_through_api_trait() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(vec![corrientes(vec![])])]));
        let api: Arc<dyn ParkingRulesApi> = Arc::new(client_with(&transport));

        let rules = assert_ok!(api.parking_rules(LAT, LON).await);
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = ParkingRulesConfig {
            retry_config: RetryConfig {
                max_attempts: 0,
                ..RetryConfig::default()
            },
            ..ParkingRulesConfig::default()
        };
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        assert!(ParkingRulesClient::new(config, transport).is_err());
    }

    fn parse_instances(instances: Vec<Value>) -> Vec<ParkingRuleInstance> {
        serde_json::from_str::<ParkingRulesResponse>(&body(instances))
            .unwrap()
            .instances
    }

    #[test]
    fn test_simplify_accumulates_same_address() {
        let instances = parse_instances(vec![
            corrientes(vec![]),
            instance(vec![
                detail("calle", "Corrientes"),
                detail("altura", "1000"),
                detail("permiso", "PROHIBIDO ESTACIONAR"),
                detail("horario", "LUNES A VIERNES DE 7 A 21"),
                detail("lado", "DERECHO"),
                detail("paridad", "PAR"),
            ]),
            instance(vec![
                detail("calle", "Florida"),
                detail("altura", "200"),
                detail("permiso", "Prohibido"),
                detail("horario", "siempre"),
                detail("lado", "ambos"),
            ]),
        ]);

        let rules = simplify_rules(&instances);

        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules["Corrientes 1000"],
            vec![
                "Lado izquierdo: permitido las 08:00-20:00.",
                "Lado derecho (par): prohibido estacionar las lunes a viernes de 7 a 21.",
            ]
        );
        assert_eq!(
            rules["Florida 200"],
            vec!["Lado ambos: prohibido las siempre."]
        );
    }

    #[test]
    fn test_simplify_ignores_unknown_fields() {
        let instances = parse_instances(vec![corrientes(vec![
            detail("tipo", "Señal vertical"),
            detail("fuente", "Relevamiento 2019"),
        ])]);

        let rules = simplify_rules(&instances);
        assert_eq!(
            rules["Corrientes 1000"],
            vec!["Lado izquierdo: permitido las 08:00-20:00."]
        );
    }

    #[test]
    fn test_simplify_missing_number_has_no_trailing_space() {
        let instances = parse_instances(vec![instance(vec![
            detail("calle", "Corrientes"),
            detail("permiso", "Permitido"),
            detail("horario", "08:00-20:00"),
            detail("lado", "Izquierdo"),
        ])]);

        let rules = simplify_rules(&instances);
        assert!(rules.contains_key("Corrientes"));
    }

    #[test]
    fn test_simplify_empty_parity_uses_plain_sentence() {
        let instances = parse_instances(vec![corrientes(vec![detail("paridad", "")])]);

        let rules = simplify_rules(&instances);
        assert_eq!(
            rules["Corrientes 1000"],
            vec!["Lado izquierdo: permitido las 08:00-20:00."]
        );
    }

    #[test]
    fn test_sentence_case() {
        assert_eq!(sentence_case("LADO DERECHO"), "Lado derecho");
        assert_eq!(sentence_case("ángulo"), "Ángulo");
        assert_eq!(sentence_case(""), "");
    }
}
