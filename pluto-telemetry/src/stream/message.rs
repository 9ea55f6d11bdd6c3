//! Inbound record parsing for the telemetry channel.
//!
//! Records are JSON objects with a `type` discriminator. Recognised event kinds
//! become alerts; `pong` and `telemetry` only prove liveness; anything else is
//! ignored. Text that is not such an object is a protocol failure.

use crate::{
    alert::{AlertKind, AlertPayload},
    error::TelemetryError,
};
use serde::Deserialize;
use smol_str::SmolStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Pong,
    /// Periodic aggregate broadcast by the backend
    Telemetry,
    Alert(AlertKind, AlertPayload),
    Unrecognised(SmolStr),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: SmolStr,
    #[serde(flatten)]
    fields: serde_json::Map<String, serde_json::Value>,
}

pub fn parse_inbound(text: &str) -> Result<Inbound, TelemetryError> {
    let Envelope { kind, fields } = serde_json::from_str::<Envelope>(text)?;

    let alert_kind = match kind.as_str() {
        "pong" => return Ok(Inbound::Pong),
        "telemetry" => return Ok(Inbound::Telemetry),
        "trade_signal" => AlertKind::TradeSignal,
        "order_submitted" => AlertKind::OrderSubmitted,
        _ => return Ok(Inbound::Unrecognised(kind)),
    };

    let payload = serde_json::from_value(serde_json::Value::Object(fields))?;
    Ok(Inbound::Alert(alert_kind, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;

    #[test]
    fn test_parse_trade_signal() {
        let text = r#"{
            "type": "trade_signal",
            "symbol": "BTCUSD",
            "side": "buy",
            "confidence": 0.72,
            "reason": "mean reversion",
            "price": 97012.5,
            "extra": {"strategy": "mr-1"}
        }"#;

        let Inbound::Alert(kind, payload) = parse_inbound(text).unwrap() else {
            panic!("expected alert");
        };

        assert_eq!(kind, AlertKind::TradeSignal);
        assert_eq!(payload.symbol.as_deref(), Some("BTCUSD"));
        assert_eq!(payload.side.as_deref(), Some("buy"));
        assert_eq!(payload.confidence, Some(0.72));
        assert_eq!(payload.price, Some(97012.5));
        assert_eq!(payload.extra["strategy"], "mr-1");
    }

    #[test]
    fn test_parse_order_submitted_with_nulls() {
        let text = r#"{"type":"order_submitted","symbol":"AAPL","side":"sell","confidence":null,"reason":null,"price":null,"extra":{"qty":2.0,"order_type":"market"}}"#;

        let Inbound::Alert(kind, payload) = parse_inbound(text).unwrap() else {
            panic!("expected alert");
        };

        assert_eq!(kind, AlertKind::OrderSubmitted);
        assert_eq!(payload.confidence, None);
        assert_eq!(payload.extra["order_type"], "market");
    }

    #[test]
    fn test_parse_inbound_classification() {
        struct TestCase {
            input: &'static str,
            expected: Result<Inbound, FailureClass>,
        }

        let tests = vec![
            TestCase {
                // TC0: heartbeat reply
                input: r#"{"type":"pong"}"#,
                expected: Ok(Inbound::Pong),
            },
            TestCase {
                // TC1: backend aggregate broadcast
                input: r#"{"type":"telemetry","btc_price":97000.0,"mode":"standby","sparkline":[1,2]}"#,
                expected: Ok(Inbound::Telemetry),
            },
            TestCase {
                // TC2: unknown discriminator is ignored, not an error
                input: r#"{"type":"welcome","message":"hi"}"#,
                expected: Ok(Inbound::Unrecognised("welcome".into())),
            },
            TestCase {
                // TC3: not json
                input: "pong",
                expected: Err(FailureClass::ProtocolFailure),
            },
            TestCase {
                // TC4: missing discriminator
                input: r#"{"symbol":"BTCUSD"}"#,
                expected: Err(FailureClass::ProtocolFailure),
            },
            TestCase {
                // TC5: recognised kind with malformed body
                input: r#"{"type":"trade_signal","confidence":"high"}"#,
                expected: Err(FailureClass::ProtocolFailure),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = parse_inbound(test.input).map_err(|error| error.class());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
