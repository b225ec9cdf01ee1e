// ===============================
// src/kraken.rs (Kraken REST gateway)
// ===============================
//
// Private endpoint: POST form `nonce=...&...`, header API-Key + API-Sign,
// API-Sign = base64(HMAC-SHA512(uri_path + SHA256(nonce + postdata), base64_decode(secret))).
// Semua respons: `{"error": [...], "result": {...}}`; error tidak kosong -> Rejected,
// kecuali error sementara (service busy, nonce, lockout) -> Transient.
//
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, error, info};

use crate::domain::{
    BalanceSnapshot, OrderKind, OrderSubmitResult, PositionFilter, PositionRecord, Side, TickerSnapshot,
};
use crate::error::{ConfigError, VenueError};
use crate::venue::VenueGateway;

pub const DEFAULT_REST_URL: &str = "https://api.kraken.com";

pub fn timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

pub fn sign_request(secret: &[u8], path: &str, nonce: u64, postdata: &str) -> Result<String, VenueError> {
    let mut sha = Sha256::new();
    sha.update(nonce.to_string().as_bytes());
    sha.update(postdata.as_bytes());
    let digest = sha.finalize();

    let mut mac = Hmac::<Sha512>::new_from_slice(secret)
        .map_err(|e| VenueError::Transient(format!("bad signing key: {e}")))?;
    mac.update(path.as_bytes());
    mac.update(&digest);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

pub fn encode_form(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Kraken reports temporary conditions through the same error list.
fn classify_errors(errors: Vec<String>) -> VenueError {
    let joined = errors.join("; ");
    let transient = errors.iter().any(|e| {
        e.starts_with("EService:") || e.starts_with("EAPI:Invalid nonce") || e.starts_with("EGeneral:Temporary")
    });
    if transient { VenueError::Transient(joined) } else { VenueError::Rejected(joined) }
}

fn parse_num(field: &str, raw: &str) -> Result<f64, VenueError> {
    raw.parse::<f64>()
        .map_err(|_| VenueError::Transient(format!("field {field}: not a number: {raw:?}")))
}

fn parse_side(raw: &str) -> Result<Side, VenueError> {
    match raw {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(VenueError::Transient(format!("unknown position type {other:?}"))),
    }
}

/// Volume as sent on the wire; Kraken accepts up to 8 decimals.
pub fn format_volume(volume: f64) -> String {
    let s = format!("{volume:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() { "0".to_string() } else { s.to_string() }
}

// ---- Wire models ----
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AddOrderResult {
    descr: OrderDescr,
    txid: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OrderDescr {
    order: String,
}

#[derive(Debug, Deserialize)]
struct CancelResult {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    a: Vec<String>, // ask [price, whole lot volume, lot volume]
    b: Vec<String>, // bid
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    ordertxid: String,
    pair: String,
    #[serde(rename = "type")]
    side: String,
    vol: String,
    #[serde(default)]
    vol_closed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenOrdersResult {
    open: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct KrakenConfig {
    pub rest_url: String,
    pub api_key: String,
    /// Base64 secret as shown by Kraken.
    pub api_secret: String,
    pub timeout: Duration,
}

pub struct KrakenClient {
    http: reqwest::Client,
    rest_url: String,
    api_key: String,
    secret: Vec<u8>,
    last_nonce: AtomicU64,
}

impl KrakenClient {
    pub fn new(cfg: KrakenConfig) -> Result<Self, ConfigError> {
        let secret = BASE64
            .decode(cfg.api_secret.trim())
            .map_err(|e| ConfigError::Invalid { key: "KRAKEN_API_SECRET", reason: e.to_string() })?;
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| ConfigError::Invalid { key: "KRAKEN_REST_URL", reason: e.to_string() })?;
        Ok(Self {
            http,
            rest_url: cfg.rest_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key,
            secret,
            last_nonce: AtomicU64::new(0),
        })
    }

    /// Strictly increasing even when called twice in the same microsecond.
    fn next_nonce(&self) -> u64 {
        let now = timestamp_micros();
        let prev = self
            .last_nonce
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(prev + 1)
    }

    fn unwrap_envelope<T>(env: Envelope<T>, method: &str) -> Result<T, VenueError> {
        if !env.error.is_empty() {
            let err = classify_errors(env.error);
            error!(%method, error = %err, "kraken returned error");
            return Err(err);
        }
        env.result.ok_or_else(|| VenueError::Transient(format!("{method}: missing result")))
    }

    async fn decode<T: DeserializeOwned>(rsp: reqwest::Response, method: &str) -> Result<T, VenueError> {
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(VenueError::Transient(format!("{method}: http {status}: {body}")));
        }
        let body = rsp.text().await?;
        let env: Envelope<T> = serde_json::from_str(&body)
            .map_err(|e| VenueError::Transient(format!("{method}: undecodable response: {e}")))?;
        Self::unwrap_envelope(env, method)
    }

    async fn private<T: DeserializeOwned>(&self, method: &str, params: &[(&str, String)]) -> Result<T, VenueError> {
        let path = format!("/0/private/{method}");
        let nonce = self.next_nonce();
        let mut all = vec![("nonce", nonce.to_string())];
        all.extend(params.iter().cloned());
        let postdata = encode_form(&all);
        let sig = sign_request(&self.secret, &path, nonce, &postdata)?;

        debug!(%method, "kraken private call");
        let rsp = self
            .http
            .post(format!("{}{}", self.rest_url, path))
            .header("API-Key", &self.api_key)
            .header("API-Sign", sig)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await?;
        Self::decode(rsp, method).await
    }

    async fn public<T: DeserializeOwned>(&self, method: &str, query: &[(&str, String)]) -> Result<T, VenueError> {
        let url = format!("{}/0/public/{}?{}", self.rest_url, method, encode_form(query));
        let rsp = self.http.get(url).send().await?;
        Self::decode(rsp, method).await
    }
}

fn to_position(entry: PositionEntry) -> Result<PositionRecord, VenueError> {
    let vol = parse_num("vol", &entry.vol)?;
    let closed = match entry.vol_closed.as_deref() {
        Some(v) => parse_num("vol_closed", v)?,
        None => 0.0,
    };
    Ok(PositionRecord {
        symbol: entry.pair,
        side: parse_side(&entry.side)?,
        volume: (vol - closed).max(0.0),
        origin_txid: entry.ordertxid,
    })
}

#[async_trait]
impl VenueGateway for KrakenClient {
    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        kind: OrderKind,
        volume: f64,
        leverage: u32,
    ) -> Result<OrderSubmitResult, VenueError> {
        let mut params = vec![
            ("pair", symbol.to_string()),
            ("type", side.as_str().to_string()),
            ("ordertype", kind.as_str().to_string()),
            ("volume", format_volume(volume)),
        ];
        if leverage > 1 {
            params.push(("leverage", leverage.to_string()));
        }
        let r: AddOrderResult = self.private("AddOrder", &params).await?;
        let txid = r
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| VenueError::Transient("AddOrder: empty txid list".into()))?;
        info!(%txid, descr = %r.descr.order, "kraken order created");
        Ok(OrderSubmitResult { txid, descr: r.descr.order })
    }

    async fn cancel_order(&self, txid: &str) -> Result<(), VenueError> {
        let r: CancelResult = self.private("CancelOrder", &[("txid", txid.to_string())]).await?;
        if r.count == 0 {
            return Err(VenueError::Rejected(format!("CancelOrder: nothing canceled for {txid}")));
        }
        Ok(())
    }

    async fn balance(&self) -> Result<BalanceSnapshot, VenueError> {
        let raw: HashMap<String, String> = self.private("Balance", &[]).await?;
        let mut amounts = HashMap::with_capacity(raw.len());
        for (k, v) in raw {
            let amount = parse_num(&k, &v)?;
            amounts.insert(k, amount);
        }
        Ok(BalanceSnapshot { amounts })
    }

    async fn ticker(&self, symbol: &str) -> Result<TickerSnapshot, VenueError> {
        let mut raw: HashMap<String, TickerEntry> = self.public("Ticker", &[("pair", symbol.to_string())]).await?;
        // Kraken may key the result by an alias of the requested pair.
        let entry = match raw.remove(symbol) {
            Some(e) => e,
            None if raw.len() == 1 => raw.into_values().next().ok_or_else(|| VenueError::Transient("Ticker: empty".into()))?,
            None => return Err(VenueError::Transient(format!("Ticker: no entry for {symbol}"))),
        };
        let first = |v: &[String], f: &str| -> Result<f64, VenueError> {
            let p = v.first().ok_or_else(|| VenueError::Transient(format!("Ticker: missing {f} price")))?;
            parse_num(f, p)
        };
        Ok(TickerSnapshot { ask: first(entry.a.as_slice(), "ask")?, bid: first(entry.b.as_slice(), "bid")? })
    }

    async fn open_positions(&self, filter: &PositionFilter) -> Result<Vec<PositionRecord>, VenueError> {
        let raw: HashMap<String, PositionEntry> = self.private("OpenPositions", &[("docalcs", "true".to_string())]).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (_, entry) in raw {
            let keep = match filter {
                PositionFilter::All => true,
                PositionFilter::Symbol(s) => &entry.pair == s,
                PositionFilter::OriginTxid(t) => &entry.ordertxid == t,
            };
            if keep {
                out.push(to_position(entry)?);
            }
        }
        Ok(out)
    }

    async fn open_orders(&self, origin_txid: Option<&str>) -> Result<Vec<String>, VenueError> {
        let r: OpenOrdersResult = self.private("OpenOrders", &[]).await?;
        Ok(r.open.into_keys().filter(|k| origin_txid.map_or(true, |t| k == t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_kraken_reference_vector() {
        // Example from Kraken's REST authentication docs.
        let secret = BASE64
            .decode("kQH5HW/8p1uGOVjbgWA7FunAmGO8lsSUXNsu3eow76sz84Q18fWxnyRzBHCd3pd5nE9qa99HAZtuZuj6F1huXg==")
            .unwrap();
        let postdata = "nonce=1616492376594&ordertype=limit&pair=XBTUSD&price=37500&type=buy&volume=1.25";
        let sig = sign_request(&secret, "/0/private/AddOrder", 1616492376594, postdata).unwrap();
        assert_eq!(sig, "4/dpxb3iT4tp/ZCVEwSnEsLxx0bqyhLpdfOpc6fn7OR8+UClSV5n9E6aSS8MPtnRfp32bAb0nmbRn6H8ndwLUQ==");
    }

    #[test]
    fn volume_is_trimmed_to_eight_decimals() {
        assert_eq!(format_volume(13.0), "13");
        assert_eq!(format_volume(22.499999999), "22.5");
        assert_eq!(format_volume(0.123456789), "0.12345679");
    }

    #[test]
    fn service_errors_are_transient() {
        assert!(matches!(classify_errors(vec!["EService:Unavailable".into()]), VenueError::Transient(_)));
        assert!(matches!(classify_errors(vec!["EOrder:Insufficient funds".into()]), VenueError::Rejected(_)));
    }

    #[test]
    fn envelope_with_error_is_rejected() {
        let env: Envelope<CancelResult> = serde_json::from_str(r#"{"error":["EOrder:Unknown order"]}"#).unwrap();
        assert!(matches!(KrakenClient::unwrap_envelope(env, "CancelOrder"), Err(VenueError::Rejected(_))));
        let env: Envelope<CancelResult> = serde_json::from_str(r#"{"error":[]}"#).unwrap();
        assert!(matches!(KrakenClient::unwrap_envelope(env, "CancelOrder"), Err(VenueError::Transient(_))));
    }

    #[test]
    fn position_volume_is_net_of_closed_part() {
        let raw = r#"{"ordertxid":"OABC","pair":"XETHXXBT","type":"sell","vol":"3.0","vol_closed":"1.0","cost":"0.1"}"#;
        let p = to_position(serde_json::from_str(raw).unwrap()).unwrap();
        assert_eq!(p.side, Side::Sell);
        assert!((p.volume - 2.0).abs() < 1e-12);
        assert_eq!(p.origin_txid, "OABC");

        let bad = r#"{"ordertxid":"OABC","pair":"XETHXXBT","type":"sell","vol":"n/a"}"#;
        assert!(matches!(to_position(serde_json::from_str(bad).unwrap()), Err(VenueError::Transient(_))));
    }

    #[test]
    fn nonce_is_strictly_increasing() {
        let c = KrakenClient::new(KrakenConfig {
            rest_url: DEFAULT_REST_URL.into(),
            api_key: "k".into(),
            api_secret: BASE64.encode(b"secret"),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        let a = c.next_nonce();
        let b = c.next_nonce();
        assert!(b > a);
    }
}
