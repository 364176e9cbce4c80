//! Request and response envelopes exchanged with RPC services.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ports::rpc::{RpcError, RpcResult};

/// Business call succeeded
pub const CALL_OK: &str = "1";
/// Generic business failure
pub const GENERAL_ERR: &str = "0";
/// The server hit an error it could not classify
pub const SERVER_UNPREDICTABLE_ERR: &str = "1000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest<T> {
    pub req_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub i18n_tag: String,
    /// Unix epoch milliseconds at which the request was sent
    pub send_mills: i64,
    pub req: T,
}

impl<T> RpcRequest<T> {
    /// Wrap `req` with a fresh request id and the current time.
    pub fn new(req: T) -> Self {
        Self {
            req_id: Uuid::new_v4().simple().to_string(),
            i18n_tag: String::new(),
            send_mills: Utc::now().timestamp_millis(),
            req,
        }
    }

    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = req_id.into();
        self
    }

    pub fn with_i18n_tag(mut self, tag: impl Into<String>) -> Self {
        self.i18n_tag = tag.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse<T> {
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err_desc: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp: Option<T>,
}

impl<T> RpcResponse<T> {
    pub fn ok(resp: T) -> Self {
        Self {
            code: CALL_OK.to_string(),
            err_desc: String::new(),
            msg: String::new(),
            resp: Some(resp),
        }
    }

    pub fn error(code: impl Into<String>, err_desc: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            err_desc: err_desc.into(),
            msg: String::new(),
            resp: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CALL_OK
    }

    /// The payload when the code is [`CALL_OK`], otherwise [`RpcError::Remote`].
    ///
    /// An ok envelope without payload is returned as `None`.
    pub fn ok_or_err(self) -> RpcResult<Option<T>> {
        if self.is_ok() {
            Ok(self.resp)
        } else {
            Err(RpcError::Remote {
                code: self.code,
                desc: self.err_desc,
                msg: self.msg,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = RpcRequest::new(json!({"token": "abc"}))
            .with_req_id("r-1")
            .with_i18n_tag("en");
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["reqId"], "r-1");
        assert_eq!(value["i18nTag"], "en");
        assert!(value["sendMills"].as_i64().unwrap() > 0);
        assert_eq!(value["req"]["token"], "abc");
    }

    #[test]
    fn test_fresh_request_ids_differ() {
        let a = RpcRequest::new(());
        let b = RpcRequest::new(());
        assert_eq!(a.req_id.len(), 32);
        assert_ne!(a.req_id, b.req_id);
    }

    #[test]
    fn test_ok_or_err() {
        let ok: RpcResponse<Value> =
            serde_json::from_value(json!({"code": "1", "resp": {"uid": 7}})).unwrap();
        assert_eq!(ok.ok_or_err().unwrap().unwrap()["uid"], 7);

        let failed: RpcResponse<Value> = serde_json::from_value(json!({
            "code": SERVER_UNPREDICTABLE_ERR,
            "errDesc": "db down",
            "msg": "try later"
        }))
        .unwrap();
        match failed.ok_or_err() {
            Err(RpcError::Remote { code, desc, msg }) => {
                assert_eq!(code, "1000");
                assert_eq!(desc, "db down");
                assert_eq!(msg, "try later");
            }
            other => panic!("unexpected {other:?}"),
        }

        let general = RpcResponse::<()>::error(GENERAL_ERR, "denied");
        assert!(!general.is_ok());
        assert!(RpcResponse::ok(1u8).is_ok());
    }
}
