use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RecordStoreConfig;

use super::{
    ObservationKind, ObservationPayload, ObservationRequest, RecordClient, RemoteId, ReportRequest,
};

const FHIR_JSON: &str = "application/fhir+json";
const FHIR_JSON_UTF8: &str = "application/fhir+json; charset=UTF-8";

const LOINC_SYSTEM: &str = "http://loinc.org";
const CATEGORY_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/observation-category";
const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";
const SNOMED_SYSTEM: &str = "http://snomed.info/sct";

/// Callback type for recording record store request metrics.
/// Receives (operation, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// FHIR REST implementation of [`RecordClient`].
pub struct FhirClient {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl FhirClient {
    /// Create a new client for the configured FHIR base URL.
    pub fn new(cfg: &RecordStoreConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FHIR_JSON));

        for (name, value) in &cfg.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name:?}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, operation: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(operation, status, duration);
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    /// PUT a resource at `path`, creating or replacing it.
    async fn put_json<T: Serialize>(&self, operation: &str, path: &str, body: &T) -> Result<()> {
        let start = Instant::now();

        let response = self
            .http
            .put(self.url(path))
            .header(CONTENT_TYPE, FHIR_JSON_UTF8)
            .json(body)
            .send()
            .await
            .with_context(|| format!("requesting PUT {path}"));

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.record_request(operation, "error", start.elapsed());
                return Err(e);
            }
        };

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(operation, "error", start.elapsed());
            bail!("unexpected status {} from PUT {}: {}", status, path, body);
        }

        self.record_request(operation, "success", start.elapsed());

        Ok(())
    }

    /// GET `path` and return only the status code.
    async fn probe(&self, operation: &str, path: &str) -> Result<StatusCode> {
        let start = Instant::now();

        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("requesting GET {path}"));

        match response {
            Ok(r) => {
                let status = r.status();
                let label = if status.is_success() || status == StatusCode::NOT_FOUND {
                    "success"
                } else {
                    "error"
                };
                self.record_request(operation, label, start.elapsed());
                Ok(status)
            }
            Err(e) => {
                self.record_request(operation, "error", start.elapsed());
                Err(e)
            }
        }
    }

    /// POST a new resource of type `resource` and return the assigned id.
    async fn create<T: Serialize>(
        &self,
        operation: &str,
        resource: &str,
        body: &T,
    ) -> Result<RemoteId> {
        let start = Instant::now();

        let response = self
            .http
            .post(self.url(resource))
            .header(CONTENT_TYPE, FHIR_JSON_UTF8)
            .json(body)
            .send()
            .await
            .with_context(|| format!("requesting POST {resource}"));

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.record_request(operation, "error", start.elapsed());
                return Err(e);
            }
        };

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            self.record_request(operation, "error", start.elapsed());
            bail!("unexpected status {} from POST {}: {}", status, resource, body);
        }

        let id = created_id(&body, location.as_deref(), resource);

        match id {
            Some(id) => {
                self.record_request(operation, "success", start.elapsed());
                Ok(id)
            }
            None => {
                self.record_request(operation, "error", start.elapsed());
                bail!("no resource id in response from POST {}", resource);
            }
        }
    }
}

impl RecordClient for FhirClient {
    async fn ensure_device_patient(&self, device_id: &str) -> Result<()> {
        debug!(device_id, "ensuring patient and device");

        self.put_json(
            "put_patient",
            &format!("Patient/{device_id}"),
            &patient_resource(device_id),
        )
        .await
        .context("upserting patient")?;

        let device_path = format!("Device/{device_id}");
        let status = self
            .probe("get_device", &device_path)
            .await
            .context("looking up device")?;

        if status == StatusCode::NOT_FOUND {
            self.put_json("put_device", &device_path, &device_resource(device_id))
                .await
                .context("creating device")?;
        } else if !status.is_success() {
            bail!("unexpected status {} from GET {}", status, device_path);
        }

        Ok(())
    }

    async fn create_observation(&self, req: &ObservationRequest) -> Result<RemoteId> {
        self.create("create_observation", "Observation", &observation_resource(req))
            .await
            .with_context(|| format!("creating {} observation", req.kind.as_str()))
    }

    async fn create_report(&self, req: &ReportRequest) -> Result<RemoteId> {
        self.create("create_report", "DiagnosticReport", &report_resource(req))
            .await
            .context("creating diagnostic report")
    }
}

/// Resolve the created resource id from the response body, falling back
/// to the Location header.
fn created_id(body: &str, location: Option<&str>, resource: &str) -> Option<RemoteId> {
    let from_body = serde_json::from_str::<CreatedResource>(body)
        .ok()
        .and_then(|r| r.id)
        .filter(|id| !id.is_empty());

    from_body
        .or_else(|| location.and_then(|loc| id_from_location(loc, resource)))
        .map(RemoteId::new)
}

/// Extract the id from a Location such as
/// `http://host/fhir/Observation/123/_history/1`.
fn id_from_location(location: &str, resource: &str) -> Option<String> {
    let mut segments = location.split('/');
    segments.find(|s| *s == resource)?;
    segments
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// --- Resource builders ---

fn patient_resource(id: &str) -> Patient {
    Patient {
        resource_type: "Patient",
        id: id.to_string(),
        name: vec![HumanName {
            given: vec!["Test".to_string()],
            family: "User".to_string(),
        }],
    }
}

fn device_resource(id: &str) -> Device {
    Device {
        resource_type: "Device",
        id: id.to_string(),
        status: "active",
        kind: CodeableConcept::coded(SNOMED_SYSTEM, "428191000124105", "NPWT Device"),
        manufacturer: "Simulated Device Inc.",
        device_name: vec![DeviceName {
            name: format!("Test Device {id}"),
            kind: "manufacturer-name",
        }],
        patient: Reference::to("Patient", id),
    }
}

fn observation_resource(req: &ObservationRequest) -> Observation {
    let kind = req.kind;
    let (category_code, category_display) = kind.category();

    let (value_quantity, value_string) = match &req.payload {
        ObservationPayload::Quantity(v) => (Some(Quantity::mmhg(*v)), None),
        ObservationPayload::Text(s) => (None, Some(s.clone())),
    };

    Observation {
        resource_type: "Observation",
        status: "final",
        category: vec![CodeableConcept::coded(
            CATEGORY_SYSTEM,
            category_code,
            category_display,
        )],
        code: CodeableConcept::coded(LOINC_SYSTEM, kind.loinc_code(), kind.display())
            .with_text(kind.text()),
        subject: Reference::to("Patient", &req.subject_id),
        device: Reference::to("Device", &req.subject_id),
        effective_date_time: format_time(req.timestamp),
        value_quantity,
        value_string,
        component: req
            .tags
            .iter()
            .map(|t| Component {
                code: CodeableConcept::text_only(&t.name),
                value_string: t.value.clone(),
            })
            .collect(),
    }
}

fn report_resource(req: &ReportRequest) -> DiagnosticReport {
    let effective_period = match (req.period_start, req.period_end) {
        (None, None) => None,
        (start, end) => Some(Period {
            start: start.map(format_time),
            end: end.map(format_time),
        }),
    };

    DiagnosticReport {
        resource_type: "DiagnosticReport",
        status: "final",
        code: CodeableConcept::text_only("Wound therapy session summary"),
        subject: Reference::to("Patient", &req.subject_id),
        effective_period,
        issued: format_time(req.issued_at),
        result: req
            .references
            .iter()
            .map(|id| Reference::to("Observation", id.as_str()))
            .collect(),
        conclusion: req.conclusion.clone(),
    }
}

// --- JSON resource structures ---

#[derive(Deserialize)]
struct CreatedResource {
    id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Patient {
    resource_type: &'static str,
    id: String,
    name: Vec<HumanName>,
}

#[derive(Serialize)]
struct HumanName {
    given: Vec<String>,
    family: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Device {
    resource_type: &'static str,
    id: String,
    status: &'static str,
    #[serde(rename = "type")]
    kind: CodeableConcept,
    manufacturer: &'static str,
    device_name: Vec<DeviceName>,
    patient: Reference,
}

#[derive(Serialize)]
struct DeviceName {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Observation {
    resource_type: &'static str,
    status: &'static str,
    category: Vec<CodeableConcept>,
    code: CodeableConcept,
    subject: Reference,
    device: Reference,
    effective_date_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_quantity: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_string: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    component: Vec<Component>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Component {
    code: CodeableConcept,
    value_string: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosticReport {
    resource_type: &'static str,
    status: &'static str,
    code: CodeableConcept,
    subject: Reference,
    #[serde(skip_serializing_if = "Option::is_none")]
    effective_period: Option<Period>,
    issued: String,
    result: Vec<Reference>,
    conclusion: String,
}

#[derive(Serialize)]
struct Period {
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<String>,
}

#[derive(Serialize)]
struct Reference {
    reference: String,
}

impl Reference {
    fn to(resource: &str, id: &str) -> Self {
        Self {
            reference: format!("{resource}/{id}"),
        }
    }
}

#[derive(Serialize)]
struct CodeableConcept {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    coding: Vec<Coding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl CodeableConcept {
    fn coded(system: &'static str, code: &'static str, display: &'static str) -> Self {
        Self {
            coding: vec![Coding {
                system,
                code,
                display,
            }],
            text: None,
        }
    }

    fn text_only(text: &str) -> Self {
        Self {
            coding: Vec::new(),
            text: Some(text.to_string()),
        }
    }

    fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }
}

#[derive(Serialize)]
struct Coding {
    system: &'static str,
    code: &'static str,
    display: &'static str,
}

#[derive(Serialize)]
struct Quantity {
    value: f64,
    unit: &'static str,
    system: &'static str,
    code: &'static str,
}

impl Quantity {
    fn mmhg(value: f64) -> Self {
        Self {
            value,
            unit: "mmHg",
            system: UCUM_SYSTEM,
            code: "mm[Hg]",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ComponentTag;

    fn at_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).expect("valid timestamp")
    }

    #[test]
    fn test_id_from_location() {
        assert_eq!(
            id_from_location(
                "http://localhost:8080/fhir/Observation/123/_history/1",
                "Observation"
            ),
            Some("123".to_string())
        );
        assert_eq!(
            id_from_location("DiagnosticReport/r-9", "DiagnosticReport"),
            Some("r-9".to_string())
        );
        assert_eq!(id_from_location("http://host/fhir/Patient/1", "Observation"), None);
        assert_eq!(id_from_location("http://host/fhir/Observation/", "Observation"), None);
    }

    #[test]
    fn test_created_id_prefers_body() {
        let id = created_id(
            r#"{"resourceType":"Observation","id":"from-body"}"#,
            Some("http://host/fhir/Observation/from-location/_history/1"),
            "Observation",
        );
        assert_eq!(id, Some(RemoteId::new("from-body")));

        let id = created_id(
            "",
            Some("http://host/fhir/Observation/from-location/_history/1"),
            "Observation",
        );
        assert_eq!(id, Some(RemoteId::new("from-location")));

        assert_eq!(created_id("{}", None, "Observation"), None);
    }

    #[test]
    fn test_observation_resource_for_reading() {
        let req = ObservationRequest {
            subject_id: "pump-1".to_string(),
            kind: ObservationKind::Value,
            payload: ObservationPayload::Quantity(-72.5),
            timestamp: at_millis(1_714_546_800_123),
            tags: vec![
                ComponentTag::device_status("running"),
                ComponentTag::therapy_mode("continuous"),
            ],
        };

        let json = serde_json::to_value(observation_resource(&req)).expect("serializes");

        assert_eq!(json["resourceType"], "Observation");
        assert_eq!(json["status"], "final");
        assert_eq!(json["code"]["coding"][0]["code"], "31209-0");
        assert_eq!(json["code"]["coding"][0]["system"], "http://loinc.org");
        assert_eq!(json["category"][0]["coding"][0]["code"], "vital-signs");
        assert_eq!(json["subject"]["reference"], "Patient/pump-1");
        assert_eq!(json["device"]["reference"], "Device/pump-1");
        assert_eq!(json["effectiveDateTime"], "2024-05-01T07:00:00.123Z");
        assert_eq!(json["valueQuantity"]["value"], -72.5);
        assert_eq!(json["valueQuantity"]["code"], "mm[Hg]");
        assert!(json.get("valueString").is_none());
        assert_eq!(json["component"][0]["code"]["text"], "Device status");
        assert_eq!(json["component"][0]["valueString"], "running");
        assert_eq!(json["component"][1]["valueString"], "continuous");
    }

    #[test]
    fn test_observation_resource_for_warning() {
        let req = ObservationRequest {
            subject_id: "pump-2".to_string(),
            kind: ObservationKind::Warning,
            payload: ObservationPayload::Text("Canister nearly full".to_string()),
            timestamp: at_millis(0),
            tags: Vec::new(),
        };

        let json = serde_json::to_value(observation_resource(&req)).expect("serializes");

        assert_eq!(json["code"]["coding"][0]["code"], "69758-7");
        assert_eq!(json["category"][0]["coding"][0]["code"], "device");
        assert_eq!(json["valueString"], "Canister nearly full");
        assert!(json.get("valueQuantity").is_none());
        assert!(json.get("component").is_none());
    }

    #[test]
    fn test_report_resource() {
        let req = ReportRequest {
            subject_id: "pump-1".to_string(),
            references: vec![RemoteId::new("o1"), RemoteId::new("o2")],
            conclusion: "Therapy session summary".to_string(),
            issued_at: at_millis(1_000),
            period_start: Some(at_millis(0)),
            period_end: None,
        };

        let json = serde_json::to_value(report_resource(&req)).expect("serializes");

        assert_eq!(json["resourceType"], "DiagnosticReport");
        assert_eq!(json["subject"]["reference"], "Patient/pump-1");
        assert_eq!(json["result"][1]["reference"], "Observation/o2");
        assert_eq!(json["issued"], "1970-01-01T00:00:01.000Z");
        assert_eq!(json["effectivePeriod"]["start"], "1970-01-01T00:00:00.000Z");
        assert!(json["effectivePeriod"].get("end").is_none());
        assert_eq!(json["conclusion"], "Therapy session summary");
    }

    #[test]
    fn test_device_resource_links_patient() {
        let json = serde_json::to_value(device_resource("pump-3")).expect("serializes");
        assert_eq!(json["id"], "pump-3");
        assert_eq!(json["patient"]["reference"], "Patient/pump-3");
        assert_eq!(json["type"]["coding"][0]["system"], "http://snomed.info/sct");
        assert_eq!(json["deviceName"][0]["type"], "manufacturer-name");
    }

    #[test]
    fn test_new_rejects_bad_header() {
        let mut cfg = RecordStoreConfig {
            endpoint: "http://localhost:8080/fhir/".to_string(),
            ..Default::default()
        };
        cfg.headers.insert("bad header".to_string(), "x".to_string());
        assert!(FhirClient::new(&cfg).is_err());
    }

    #[test]
    fn test_new_trims_endpoint() {
        let cfg = RecordStoreConfig {
            endpoint: "http://localhost:8080/fhir/".to_string(),
            ..Default::default()
        };
        let client = FhirClient::new(&cfg).expect("client builds");
        assert_eq!(client.url("Observation"), "http://localhost:8080/fhir/Observation");
    }
}
