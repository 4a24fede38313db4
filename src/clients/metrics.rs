//! Time-series metrics query client.

use crate::clients::http::{ClientSettings, HttpTransport};
use crate::clients::MetricsApi;
use crate::errors::{CutoverError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Series>,
}

#[derive(Deserialize)]
struct Series {
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn parse_sample(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok()
}

impl QueryResponse {
    fn into_series(self, expr: &str) -> Result<Vec<Series>> {
        if self.status != "success" {
            return Err(CutoverError::http(
                "metrics",
                format!("query '{expr}' failed: {}", self.error.unwrap_or_default()),
                StatusCode::BAD_REQUEST.as_u16(),
            ));
        }
        Ok(self.data.map(|d| d.result).unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct HttpMetrics {
    transport: HttpTransport,
}

impl HttpMetrics {
    pub fn new(address: &str, settings: &ClientSettings) -> Result<Self> {
        Ok(Self { transport: HttpTransport::new("metrics", address, settings)? })
    }

    async fn run(&self, path: &str, params: &[(&str, String)]) -> Result<QueryResponse> {
        let request = self.transport.request(Method::GET, path)?.query(params);
        let response = self.transport.send(request).await?;
        self.transport.json(response).await
    }
}

#[async_trait]
impl MetricsApi for HttpMetrics {
    /// First sample of an instant vector; `None` when the vector is empty
    async fn query(&self, expr: &str) -> Result<Option<f64>> {
        let response = self.run("/api/v1/query", &[("query", expr.to_string())]).await?;
        let series = response.into_series(expr)?;
        Ok(series.into_iter().find_map(|s| s.value.and_then(|(_, v)| parse_sample(&v))))
    }

    async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_secs: u64,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let params = [
            ("query", expr.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", format!("{}s", step_secs.max(1))),
        ];
        let response = self.run("/api/v1/query_range", &params).await?;
        let series = response.into_series(expr)?;

        Ok(series
            .into_iter()
            .next()
            .map(|s| {
                s.values
                    .into_iter()
                    .filter_map(|(ts, v)| {
                        let at = DateTime::from_timestamp(ts as i64, 0)?;
                        parse_sample(&v).map(|value| (at, value))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ready(&self) -> Result<bool> {
        let response = self.transport.send(self.transport.request(Method::GET, "/-/ready")?).await?;
        Ok(response.status().is_success())
    }
}

/// Fill `{app}` and `{version}` placeholders of a query template
pub fn render_query(template: &str, application: &str, version: &str) -> String {
    template.replace("{app}", application).replace("{version}", version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_query() {
        assert_eq!(
            render_query("rate(errors{app=\"{app}\",version=\"{version}\"}[5m])", "web", "v2"),
            "rate(errors{app=\"web\",version=\"v2\"}[5m])"
        );
    }

    #[test]
    fn test_parse_vector_response() {
        let body = r#"{"status":"success","data":{"resultType":"vector",
            "result":[{"metric":{},"value":[1700000000.1,"0.0125"]}]}}"#;
        let response: QueryResponse = serde_json::from_str(body).unwrap();
        let series = response.into_series("q").unwrap();
        assert_eq!(series[0].value.as_ref().and_then(|(_, v)| parse_sample(v)), Some(0.0125));
    }

    #[test]
    fn test_nan_sample_parses_as_nan() {
        assert!(parse_sample("NaN").unwrap().is_nan());
        assert!(parse_sample("garbage").is_none());
    }
}
