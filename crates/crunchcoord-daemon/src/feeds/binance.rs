// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use serde_json::{json, Map, Value};
use std::time::Duration;

use super::{DataFeed, FeedDataRecord, FeedError, FeedFetchRequest};

const BINANCE_API: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Spot-market kline adapter. Subjects are quoted against USDT
/// (`BTC` → `BTCUSDT`).
pub struct BinanceFeed {
    http: reqwest::Client,
    base_url: String,
}

impl BinanceFeed {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: BINANCE_API.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn symbol(subject: &str) -> String {
        let subject = subject.to_ascii_uppercase();
        if subject.ends_with("USDT") {
            subject
        } else {
            format!("{subject}USDT")
        }
    }

    async fn klines(
        &self,
        subject: &str,
        request: &FeedFetchRequest,
    ) -> Result<Vec<FeedDataRecord>, FeedError> {
        let mut query: Vec<(String, String)> = vec![
            ("symbol".to_string(), Self::symbol(subject)),
            ("interval".to_string(), request.granularity.clone()),
            (
                "limit".to_string(),
                request
                    .limit
                    .unwrap_or(MAX_KLINES_PER_REQUEST)
                    .min(MAX_KLINES_PER_REQUEST)
                    .to_string(),
            ),
        ];
        if let Some(start_ts) = request.start_ts {
            query.push(("startTime".to_string(), (start_ts * 1000).to_string()));
        }
        if let Some(end_ts) = request.end_ts {
            query.push(("endTime".to_string(), (end_ts * 1000).to_string()));
        }

        let response = self
            .http
            .get(format!("{}/api/v3/klines", self.base_url))
            .query(&query)
            .send()
            .await
            .map_err(|e| FeedError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FeedError::Permanent(format!(
                "klines request rejected: {status}"
            )));
        }
        if !status.is_success() {
            return Err(FeedError::Transient(format!("klines request failed: {status}")));
        }

        let payload: Vec<Vec<Value>> = response
            .json()
            .await
            .map_err(|e| FeedError::Transient(e.to_string()))?;

        let mut records = Vec::with_capacity(payload.len());
        for kline in payload {
            let Some(record) = kline_to_record(subject, request, &kline) else {
                continue;
            };
            records.push(record);
        }
        Ok(records)
    }
}

/// Kline array layout: [open_time_ms, open, high, low, close, volume, ...].
/// Numeric fields arrive as strings.
fn kline_to_record(
    subject: &str,
    request: &FeedFetchRequest,
    kline: &[Value],
) -> Option<FeedDataRecord> {
    let open_time_ms = kline.first()?.as_i64()?;
    let field = |index: usize| -> Option<f64> {
        match kline.get(index)? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };

    let mut values = Map::new();
    values.insert("open".to_string(), json!(field(1)?));
    values.insert("high".to_string(), json!(field(2)?));
    values.insert("low".to_string(), json!(field(3)?));
    values.insert("close".to_string(), json!(field(4)?));
    values.insert("volume".to_string(), json!(field(5).unwrap_or(0.0)));

    Some(FeedDataRecord {
        source: "binance".to_string(),
        subject: subject.to_string(),
        kind: request.kind.clone(),
        granularity: request.granularity.clone(),
        ts_event: open_time_ms / 1000,
        values,
        metadata: Map::new(),
    })
}

#[async_trait::async_trait]
impl DataFeed for BinanceFeed {
    fn source(&self) -> &str {
        "binance"
    }

    async fn fetch(&self, request: &FeedFetchRequest) -> Result<Vec<FeedDataRecord>, FeedError> {
        let mut records = Vec::new();
        for subject in &request.subjects {
            records.extend(self.klines(subject, request).await?);
        }
        records.sort_by_key(|r| r.ts_event);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> FeedFetchRequest {
        FeedFetchRequest {
            subjects: vec!["BTC".to_string()],
            kind: "candle".to_string(),
            granularity: "1m".to_string(),
            start_ts: None,
            end_ts: None,
            limit: Some(10),
        }
    }

    #[test]
    fn subjects_map_to_usdt_pairs() {
        assert_eq!(BinanceFeed::symbol("BTC"), "BTCUSDT");
        assert_eq!(BinanceFeed::symbol("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn klines_parse_string_encoded_numbers() {
        let kline = json!([
            1_767_225_600_000i64,
            "42000.1",
            "42100.5",
            "41900.0",
            "42050.2",
            "12.5",
            1_767_225_659_999i64
        ]);
        let record = kline_to_record("BTC", &request(), kline.as_array().unwrap()).unwrap();
        assert_eq!(record.ts_event, 1_767_225_600);
        assert_eq!(record.values["close"], json!(42050.2));
        assert_eq!(record.values["volume"], json!(12.5));
    }

    #[test]
    fn malformed_klines_are_skipped() {
        let kline = json!(["not-a-timestamp", "1", "2", "3", "4", "5"]);
        assert!(kline_to_record("BTC", &request(), kline.as_array().unwrap()).is_none());
    }
}
