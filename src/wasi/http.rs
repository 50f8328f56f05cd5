//! `wasi:http`: messages, headers and the outgoing handler.

use super::io::{INPUT_STREAM, OUTPUT_STREAM, POLLABLE};
use crate::func::{ComponentValue, Operation, Payload, take_variant};
use crate::resources::ResourceKind;
use crate::types::Type;
use crate::values::Val;
use anyhow::{Result, bail};
use std::fmt;
use std::sync::LazyLock;

pub const TYPES_INTERFACE: &str = "wasi:http/types@0.2.2";
pub const OUTGOING_HANDLER_INTERFACE: &str = "wasi:http/outgoing-handler@0.2.2";

pub const FIELDS: ResourceKind = ResourceKind::new(7);
pub const INCOMING_REQUEST: ResourceKind = ResourceKind::new(8);
pub const INCOMING_BODY: ResourceKind = ResourceKind::new(9);
pub const OUTGOING_REQUEST: ResourceKind = ResourceKind::new(10);
pub const OUTGOING_BODY: ResourceKind = ResourceKind::new(11);
pub const RESPONSE_OUTPARAM: ResourceKind = ResourceKind::new(12);
pub const OUTGOING_RESPONSE: ResourceKind = ResourceKind::new(13);
pub const INCOMING_RESPONSE: ResourceKind = ResourceKind::new(14);
pub const FUTURE_INCOMING_RESPONSE: ResourceKind = ResourceKind::new(15);
pub const REQUEST_OPTIONS: ResourceKind = ResourceKind::new(16);

fn unit(payload: Option<Val>) -> Result<()> {
    <()>::from_payload(payload)
}

/// An HTTP request method.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Other(String),
}

impl Method {
    const CASES: [&'static str; 10] = [
        "get", "head", "post", "put", "delete", "connect", "options", "trace", "patch", "other",
    ];

    /// The `method` variant.
    pub fn ty() -> Type {
        static TY: LazyLock<Type> = LazyLock::new(|| {
            Type::variant(Method::CASES.iter().map(|case| {
                let payload = (*case == "other").then_some(Type::String);
                (*case, payload)
            }))
        });
        TY.clone()
    }
}

impl ComponentValue for Method {
    fn typecheck(ty: &Type) -> Result<()> {
        let cases = crate::func::typecheck_variant(ty, Method::CASES)?;
        for (case, payload) in Method::CASES.iter().zip(cases) {
            if *case == "other" {
                String::typecheck_payload(payload)?;
            } else {
                <()>::typecheck_payload(payload)?;
            }
        }
        Ok(())
    }

    fn into_val(self) -> Val {
        let (case, payload) = match self {
            Method::Get => ("get", None),
            Method::Head => ("head", None),
            Method::Post => ("post", None),
            Method::Put => ("put", None),
            Method::Delete => ("delete", None),
            Method::Connect => ("connect", None),
            Method::Options => ("options", None),
            Method::Trace => ("trace", None),
            Method::Patch => ("patch", None),
            Method::Other(s) => ("other", Some(Box::new(Val::String(s)))),
        };
        Val::Variant(case.to_string(), payload)
    }

    fn from_val(val: Val) -> Result<Method> {
        let (case, payload) = take_variant(val)?;
        let method = match case.as_str() {
            "other" => return Ok(Method::Other(String::from_payload(payload)?)),
            "get" => Method::Get,
            "head" => Method::Head,
            "post" => Method::Post,
            "put" => Method::Put,
            "delete" => Method::Delete,
            "connect" => Method::Connect,
            "options" => Method::Options,
            "trace" => Method::Trace,
            "patch" => Method::Patch,
            other => bail!("unknown case `{other}` of method"),
        };
        unit(payload)?;
        Ok(method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Other(s) => s,
        })
    }
}

/// A URI scheme.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Other(String),
}

impl Scheme {
    /// The `scheme` variant.
    pub fn ty() -> Type {
        static TY: LazyLock<Type> = LazyLock::new(|| {
            Type::variant([("HTTP", None), ("HTTPS", None), ("other", Some(Type::String))])
        });
        TY.clone()
    }
}

impl ComponentValue for Scheme {
    fn typecheck(ty: &Type) -> Result<()> {
        let [http, https, other] = crate::func::typecheck_variant(ty, ["HTTP", "HTTPS", "other"])?;
        <()>::typecheck_payload(http)?;
        <()>::typecheck_payload(https)?;
        String::typecheck_payload(other)
    }

    fn into_val(self) -> Val {
        match self {
            Scheme::Http => Val::Variant("HTTP".into(), None),
            Scheme::Https => Val::Variant("HTTPS".into(), None),
            Scheme::Other(s) => Val::Variant("other".into(), Some(Box::new(Val::String(s)))),
        }
    }

    fn from_val(val: Val) -> Result<Scheme> {
        let (case, payload) = take_variant(val)?;
        match case.as_str() {
            "HTTP" => unit(payload).map(|()| Scheme::Http),
            "HTTPS" => unit(payload).map(|()| Scheme::Https),
            "other" => Ok(Scheme::Other(String::from_payload(payload)?)),
            other => bail!("unknown case `{other}` of scheme"),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Other(s) => s,
        })
    }
}

/// Why a `fields` operation was refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HeaderError {
    /// The name or value is not valid HTTP syntax.
    InvalidSyntax,
    /// The header may not be set by a guest.
    Forbidden,
    /// The fields belong to a message and can no longer change.
    Immutable,
}

impl HeaderError {
    const CASES: [&'static str; 3] = ["invalid-syntax", "forbidden", "immutable"];

    /// The `header-error` variant.
    pub fn ty() -> Type {
        static TY: LazyLock<Type> =
            LazyLock::new(|| Type::variant(HeaderError::CASES.map(|case| (case, None))));
        TY.clone()
    }

    fn name(self) -> &'static str {
        match self {
            HeaderError::InvalidSyntax => "invalid-syntax",
            HeaderError::Forbidden => "forbidden",
            HeaderError::Immutable => "immutable",
        }
    }
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::error::Error for HeaderError {}

impl ComponentValue for HeaderError {
    fn typecheck(ty: &Type) -> Result<()> {
        for payload in crate::func::typecheck_variant(ty, HeaderError::CASES)? {
            <()>::typecheck_payload(payload)?;
        }
        Ok(())
    }

    fn into_val(self) -> Val {
        Val::Variant(self.name().to_string(), None)
    }

    fn from_val(val: Val) -> Result<HeaderError> {
        let (case, payload) = take_variant(val)?;
        unit(payload)?;
        match case.as_str() {
            "invalid-syntax" => Ok(HeaderError::InvalidSyntax),
            "forbidden" => Ok(HeaderError::Forbidden),
            "immutable" => Ok(HeaderError::Immutable),
            other => bail!("unknown case `{other}` of header-error"),
        }
    }
}

/// Payload of [`ErrorCode::DnsError`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsErrorPayload {
    pub rcode: Option<String>,
    pub info_code: Option<u16>,
}

wit_record!(DnsErrorPayload {
    rcode: Option<String> = "rcode",
    info_code: Option<u16> = "info-code",
});

/// Payload of [`ErrorCode::TlsAlertReceived`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsAlertReceivedPayload {
    pub alert_id: Option<u8>,
    pub alert_message: Option<String>,
}

wit_record!(TlsAlertReceivedPayload {
    alert_id: Option<u8> = "alert-id",
    alert_message: Option<String> = "alert-message",
});

/// Name and size of a header or trailer which was too large.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldSizePayload {
    pub field_name: Option<String>,
    pub field_size: Option<u32>,
}

wit_record!(FieldSizePayload {
    field_name: Option<String> = "field-name",
    field_size: Option<u32> = "field-size",
});

/// Error codes of the HTTP interfaces, as defined by the proxy-status
/// registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    DnsTimeout,
    DnsError(DnsErrorPayload),
    DestinationNotFound,
    DestinationUnavailable,
    DestinationIpProhibited,
    DestinationIpUnroutable,
    ConnectionRefused,
    ConnectionTerminated,
    ConnectionTimeout,
    ConnectionReadTimeout,
    ConnectionWriteTimeout,
    ConnectionLimitReached,
    TlsProtocolError,
    TlsCertificateError,
    TlsAlertReceived(TlsAlertReceivedPayload),
    HttpRequestDenied,
    HttpRequestLengthRequired,
    HttpRequestBodySize(Option<u64>),
    HttpRequestMethodInvalid,
    HttpRequestUriInvalid,
    HttpRequestUriTooLong,
    HttpRequestHeaderSectionSize(Option<u32>),
    HttpRequestHeaderSize(Option<FieldSizePayload>),
    HttpRequestTrailerSectionSize(Option<u32>),
    HttpRequestTrailerSize(FieldSizePayload),
    HttpResponseIncomplete,
    HttpResponseHeaderSectionSize(Option<u32>),
    HttpResponseHeaderSize(FieldSizePayload),
    HttpResponseBodySize(Option<u64>),
    HttpResponseTrailerSectionSize(Option<u32>),
    HttpResponseTrailerSize(FieldSizePayload),
    HttpResponseTransferCoding(Option<String>),
    HttpResponseContentCoding(Option<String>),
    HttpResponseTimeout,
    HttpUpgradeFailed,
    HttpProtocolError,
    LoopDetected,
    ConfigurationError,
    /// Catch-all for errors not covered by the other cases.
    InternalError(Option<String>),
}

type PayloadCheck = fn(Option<&Type>) -> Result<()>;

// case name and payload check, in declaration order
const ERROR_CODE_CASES: [(&str, PayloadCheck); 39] = [
    ("DNS-timeout", <()>::typecheck_payload),
    ("DNS-error", DnsErrorPayload::typecheck_payload),
    ("destination-not-found", <()>::typecheck_payload),
    ("destination-unavailable", <()>::typecheck_payload),
    ("destination-IP-prohibited", <()>::typecheck_payload),
    ("destination-IP-unroutable", <()>::typecheck_payload),
    ("connection-refused", <()>::typecheck_payload),
    ("connection-terminated", <()>::typecheck_payload),
    ("connection-timeout", <()>::typecheck_payload),
    ("connection-read-timeout", <()>::typecheck_payload),
    ("connection-write-timeout", <()>::typecheck_payload),
    ("connection-limit-reached", <()>::typecheck_payload),
    ("TLS-protocol-error", <()>::typecheck_payload),
    ("TLS-certificate-error", <()>::typecheck_payload),
    ("TLS-alert-received", TlsAlertReceivedPayload::typecheck_payload),
    ("HTTP-request-denied", <()>::typecheck_payload),
    ("HTTP-request-length-required", <()>::typecheck_payload),
    ("HTTP-request-body-size", <Option<u64>>::typecheck_payload),
    ("HTTP-request-method-invalid", <()>::typecheck_payload),
    ("HTTP-request-URI-invalid", <()>::typecheck_payload),
    ("HTTP-request-URI-too-long", <()>::typecheck_payload),
    ("HTTP-request-header-section-size", <Option<u32>>::typecheck_payload),
    ("HTTP-request-header-size", <Option<FieldSizePayload>>::typecheck_payload),
    ("HTTP-request-trailer-section-size", <Option<u32>>::typecheck_payload),
    ("HTTP-request-trailer-size", FieldSizePayload::typecheck_payload),
    ("HTTP-response-incomplete", <()>::typecheck_payload),
    ("HTTP-response-header-section-size", <Option<u32>>::typecheck_payload),
    ("HTTP-response-header-size", FieldSizePayload::typecheck_payload),
    ("HTTP-response-body-size", <Option<u64>>::typecheck_payload),
    ("HTTP-response-trailer-section-size", <Option<u32>>::typecheck_payload),
    ("HTTP-response-trailer-size", FieldSizePayload::typecheck_payload),
    ("HTTP-response-transfer-coding", <Option<String>>::typecheck_payload),
    ("HTTP-response-content-coding", <Option<String>>::typecheck_payload),
    ("HTTP-response-timeout", <()>::typecheck_payload),
    ("HTTP-upgrade-failed", <()>::typecheck_payload),
    ("HTTP-protocol-error", <()>::typecheck_payload),
    ("loop-detected", <()>::typecheck_payload),
    ("configuration-error", <()>::typecheck_payload),
    ("internal-error", <Option<String>>::typecheck_payload),
];

impl ErrorCode {
    /// The `error-code` variant.
    pub fn ty() -> Type {
        static TY: LazyLock<Type> = LazyLock::new(|| {
            let dns = Type::record([
                ("rcode", Type::option(Type::String)),
                ("info-code", Type::option(Type::U16)),
            ]);
            let tls = Type::record([
                ("alert-id", Type::option(Type::U8)),
                ("alert-message", Type::option(Type::String)),
            ]);
            let field_size = Type::record([
                ("field-name", Type::option(Type::String)),
                ("field-size", Type::option(Type::U32)),
            ]);
            let u32 = || Some(Type::option(Type::U32));
            let u64 = || Some(Type::option(Type::U64));
            let string = || Some(Type::option(Type::String));
            let payloads = [
                None,
                Some(dns),
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                Some(tls),
                None,
                None,
                u64(),
                None,
                None,
                None,
                u32(),
                Some(Type::option(field_size.clone())),
                u32(),
                Some(field_size.clone()),
                None,
                u32(),
                Some(field_size.clone()),
                u64(),
                u32(),
                Some(field_size),
                string(),
                string(),
                None,
                None,
                None,
                None,
                None,
                string(),
            ];
            Type::variant(ERROR_CODE_CASES.iter().map(|(name, _)| *name).zip(payloads))
        });
        TY.clone()
    }

    /// The WIT case name, e.g. `DNS-timeout`.
    pub fn name(&self) -> &'static str {
        ERROR_CODE_CASES[self.index()].0
    }

    fn index(&self) -> usize {
        use ErrorCode::*;
        match self {
            DnsTimeout => 0,
            DnsError(_) => 1,
            DestinationNotFound => 2,
            DestinationUnavailable => 3,
            DestinationIpProhibited => 4,
            DestinationIpUnroutable => 5,
            ConnectionRefused => 6,
            ConnectionTerminated => 7,
            ConnectionTimeout => 8,
            ConnectionReadTimeout => 9,
            ConnectionWriteTimeout => 10,
            ConnectionLimitReached => 11,
            TlsProtocolError => 12,
            TlsCertificateError => 13,
            TlsAlertReceived(_) => 14,
            HttpRequestDenied => 15,
            HttpRequestLengthRequired => 16,
            HttpRequestBodySize(_) => 17,
            HttpRequestMethodInvalid => 18,
            HttpRequestUriInvalid => 19,
            HttpRequestUriTooLong => 20,
            HttpRequestHeaderSectionSize(_) => 21,
            HttpRequestHeaderSize(_) => 22,
            HttpRequestTrailerSectionSize(_) => 23,
            HttpRequestTrailerSize(_) => 24,
            HttpResponseIncomplete => 25,
            HttpResponseHeaderSectionSize(_) => 26,
            HttpResponseHeaderSize(_) => 27,
            HttpResponseBodySize(_) => 28,
            HttpResponseTrailerSectionSize(_) => 29,
            HttpResponseTrailerSize(_) => 30,
            HttpResponseTransferCoding(_) => 31,
            HttpResponseContentCoding(_) => 32,
            HttpResponseTimeout => 33,
            HttpUpgradeFailed => 34,
            HttpProtocolError => 35,
            LoopDetected => 36,
            ConfigurationError => 37,
            InternalError(_) => 38,
        }
    }

    fn payload(self) -> Option<Val> {
        use ErrorCode::*;
        match self {
            DnsError(p) => p.into_payload(),
            TlsAlertReceived(p) => p.into_payload(),
            HttpRequestBodySize(p) | HttpResponseBodySize(p) => p.into_payload(),
            HttpRequestHeaderSectionSize(p)
            | HttpRequestTrailerSectionSize(p)
            | HttpResponseHeaderSectionSize(p)
            | HttpResponseTrailerSectionSize(p) => p.into_payload(),
            HttpRequestHeaderSize(p) => p.into_payload(),
            HttpRequestTrailerSize(p)
            | HttpResponseHeaderSize(p)
            | HttpResponseTrailerSize(p) => p.into_payload(),
            HttpResponseTransferCoding(p)
            | HttpResponseContentCoding(p)
            | InternalError(p) => p.into_payload(),
            _ => None,
        }
    }

    fn from_case(case: &str, payload: Option<Val>) -> Result<ErrorCode> {
        use ErrorCode::*;
        let code = match case {
            "DNS-timeout" => DnsTimeout,
            "DNS-error" => return Ok(DnsError(Payload::from_payload(payload)?)),
            "destination-not-found" => DestinationNotFound,
            "destination-unavailable" => DestinationUnavailable,
            "destination-IP-prohibited" => DestinationIpProhibited,
            "destination-IP-unroutable" => DestinationIpUnroutable,
            "connection-refused" => ConnectionRefused,
            "connection-terminated" => ConnectionTerminated,
            "connection-timeout" => ConnectionTimeout,
            "connection-read-timeout" => ConnectionReadTimeout,
            "connection-write-timeout" => ConnectionWriteTimeout,
            "connection-limit-reached" => ConnectionLimitReached,
            "TLS-protocol-error" => TlsProtocolError,
            "TLS-certificate-error" => TlsCertificateError,
            "TLS-alert-received" => return Ok(TlsAlertReceived(Payload::from_payload(payload)?)),
            "HTTP-request-denied" => HttpRequestDenied,
            "HTTP-request-length-required" => HttpRequestLengthRequired,
            "HTTP-request-body-size" => {
                return Ok(HttpRequestBodySize(Payload::from_payload(payload)?));
            }
            "HTTP-request-method-invalid" => HttpRequestMethodInvalid,
            "HTTP-request-URI-invalid" => HttpRequestUriInvalid,
            "HTTP-request-URI-too-long" => HttpRequestUriTooLong,
            "HTTP-request-header-section-size" => {
                return Ok(HttpRequestHeaderSectionSize(Payload::from_payload(payload)?));
            }
            "HTTP-request-header-size" => {
                return Ok(HttpRequestHeaderSize(Payload::from_payload(payload)?));
            }
            "HTTP-request-trailer-section-size" => {
                return Ok(HttpRequestTrailerSectionSize(Payload::from_payload(payload)?));
            }
            "HTTP-request-trailer-size" => {
                return Ok(HttpRequestTrailerSize(Payload::from_payload(payload)?));
            }
            "HTTP-response-incomplete" => HttpResponseIncomplete,
            "HTTP-response-header-section-size" => {
                return Ok(HttpResponseHeaderSectionSize(Payload::from_payload(payload)?));
            }
            "HTTP-response-header-size" => {
                return Ok(HttpResponseHeaderSize(Payload::from_payload(payload)?));
            }
            "HTTP-response-body-size" => {
                return Ok(HttpResponseBodySize(Payload::from_payload(payload)?));
            }
            "HTTP-response-trailer-section-size" => {
                return Ok(HttpResponseTrailerSectionSize(Payload::from_payload(payload)?));
            }
            "HTTP-response-trailer-size" => {
                return Ok(HttpResponseTrailerSize(Payload::from_payload(payload)?));
            }
            "HTTP-response-transfer-coding" => {
                return Ok(HttpResponseTransferCoding(Payload::from_payload(payload)?));
            }
            "HTTP-response-content-coding" => {
                return Ok(HttpResponseContentCoding(Payload::from_payload(payload)?));
            }
            "HTTP-response-timeout" => HttpResponseTimeout,
            "HTTP-upgrade-failed" => HttpUpgradeFailed,
            "HTTP-protocol-error" => HttpProtocolError,
            "loop-detected" => LoopDetected,
            "configuration-error" => ConfigurationError,
            "internal-error" => return Ok(InternalError(Payload::from_payload(payload)?)),
            other => bail!("unknown case `{other}` of error-code"),
        };
        unit(payload)?;
        Ok(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InternalError(Some(msg)) => write!(f, "internal-error: {msg}"),
            other => f.write_str(other.name()),
        }
    }
}

impl std::error::Error for ErrorCode {}

impl ComponentValue for ErrorCode {
    fn typecheck(ty: &Type) -> Result<()> {
        let Type::Variant(variant) = ty else {
            bail!("type mismatch: expected variant, found {}", ty.desc());
        };
        if variant.cases.len() != ERROR_CODE_CASES.len() {
            bail!(
                "expected {} cases, found {}",
                ERROR_CODE_CASES.len(),
                variant.cases.len()
            );
        }
        for ((case, payload), (name, check)) in variant.cases.iter().zip(ERROR_CODE_CASES) {
            if case != name {
                bail!("expected case `{name}`, found `{case}`");
            }
            check(payload.as_ref())?;
        }
        Ok(())
    }

    fn into_val(self) -> Val {
        let name = self.name().to_string();
        Val::Variant(name, self.payload().map(Box::new))
    }

    fn from_val(val: Val) -> Result<ErrorCode> {
        let (case, payload) = take_variant(val)?;
        ErrorCode::from_case(&case, payload)
    }
}

fn http_result(ok: Option<Type>) -> Option<Type> {
    Some(Type::result(ok, Some(ErrorCode::ty())))
}

fn header_result(ok: Option<Type>) -> Option<Type> {
    Some(Type::result(ok, Some(HeaderError::ty())))
}

// `result<T>`, failing without a payload
fn bare_result(ok: Option<Type>) -> Option<Type> {
    Some(Type::result(ok, None))
}

fn method(resource: &str, name: &str) -> String {
    format!("[method]{resource}.{name}")
}

/// Operations of `wasi:http/types` and `wasi:http/outgoing-handler`.
pub fn operations() -> Vec<Operation> {
    let types = |name: &str, params: Vec<Type>, result: Option<Type>| {
        Operation::new(TYPES_INTERFACE, name, params, result)
    };
    let bytes = || Type::list(Type::U8);
    let entry = || Type::tuple([Type::String, bytes()]);
    let own_fields = || Some(Type::own(FIELDS));
    let fields = || Type::borrow(FIELDS);
    let opt_string = || Type::option(Type::String);

    let mut ops = vec![
        types("[constructor]fields", vec![], own_fields()),
        types(
            "[static]fields.from-list",
            vec![Type::list(entry())],
            header_result(own_fields()),
        ),
        types(
            &method("fields", "get"),
            vec![fields(), Type::String],
            Some(Type::list(bytes())),
        ),
        types(
            &method("fields", "has"),
            vec![fields(), Type::String],
            Some(Type::Bool),
        ),
        types(
            &method("fields", "set"),
            vec![fields(), Type::String, Type::list(bytes())],
            header_result(None),
        ),
        types(
            &method("fields", "delete"),
            vec![fields(), Type::String],
            header_result(None),
        ),
        types(
            &method("fields", "append"),
            vec![fields(), Type::String, bytes()],
            header_result(None),
        ),
        types(
            &method("fields", "entries"),
            vec![fields()],
            Some(Type::list(entry())),
        ),
        types(&method("fields", "clone"), vec![fields()], own_fields()),
    ];

    let incoming = || Type::borrow(INCOMING_REQUEST);
    ops.extend([
        types(
            &method("incoming-request", "method"),
            vec![incoming()],
            Some(Method::ty()),
        ),
        types(
            &method("incoming-request", "path-with-query"),
            vec![incoming()],
            Some(opt_string()),
        ),
        types(
            &method("incoming-request", "scheme"),
            vec![incoming()],
            Some(Type::option(Scheme::ty())),
        ),
        types(
            &method("incoming-request", "authority"),
            vec![incoming()],
            Some(opt_string()),
        ),
        types(
            &method("incoming-request", "headers"),
            vec![incoming()],
            own_fields(),
        ),
        types(
            &method("incoming-request", "consume"),
            vec![incoming()],
            bare_result(Some(Type::own(INCOMING_BODY))),
        ),
    ]);

    let outgoing = || Type::borrow(OUTGOING_REQUEST);
    ops.extend([
        types(
            "[constructor]outgoing-request",
            vec![Type::own(FIELDS)],
            Some(Type::own(OUTGOING_REQUEST)),
        ),
        types(
            &method("outgoing-request", "body"),
            vec![outgoing()],
            bare_result(Some(Type::own(OUTGOING_BODY))),
        ),
        types(
            &method("outgoing-request", "set-method"),
            vec![outgoing(), Method::ty()],
            bare_result(None),
        ),
        types(
            &method("outgoing-request", "set-path-with-query"),
            vec![outgoing(), opt_string()],
            bare_result(None),
        ),
        types(
            &method("outgoing-request", "set-scheme"),
            vec![outgoing(), Type::option(Scheme::ty())],
            bare_result(None),
        ),
        types(
            &method("outgoing-request", "set-authority"),
            vec![outgoing(), opt_string()],
            bare_result(None),
        ),
        types(
            &method("outgoing-request", "headers"),
            vec![outgoing()],
            own_fields(),
        ),
    ]);

    ops.extend([
        types(
            "[static]response-outparam.set",
            vec![
                Type::own(RESPONSE_OUTPARAM),
                Type::result(Some(Type::own(OUTGOING_RESPONSE)), Some(ErrorCode::ty())),
            ],
            None,
        ),
        types(
            &method("incoming-response", "status"),
            vec![Type::borrow(INCOMING_RESPONSE)],
            Some(Type::U16),
        ),
        types(
            &method("incoming-response", "headers"),
            vec![Type::borrow(INCOMING_RESPONSE)],
            own_fields(),
        ),
        types(
            &method("incoming-response", "consume"),
            vec![Type::borrow(INCOMING_RESPONSE)],
            bare_result(Some(Type::own(INCOMING_BODY))),
        ),
        types(
            &method("incoming-body", "stream"),
            vec![Type::borrow(INCOMING_BODY)],
            bare_result(Some(Type::own(INPUT_STREAM))),
        ),
        types(
            "[constructor]outgoing-response",
            vec![Type::own(FIELDS)],
            Some(Type::own(OUTGOING_RESPONSE)),
        ),
        types(
            &method("outgoing-response", "set-status-code"),
            vec![Type::borrow(OUTGOING_RESPONSE), Type::U16],
            bare_result(None),
        ),
        types(
            &method("outgoing-response", "headers"),
            vec![Type::borrow(OUTGOING_RESPONSE)],
            own_fields(),
        ),
        types(
            &method("outgoing-response", "body"),
            vec![Type::borrow(OUTGOING_RESPONSE)],
            bare_result(Some(Type::own(OUTGOING_BODY))),
        ),
        types(
            &method("outgoing-body", "write"),
            vec![Type::borrow(OUTGOING_BODY)],
            bare_result(Some(Type::own(OUTPUT_STREAM))),
        ),
        types(
            "[static]outgoing-body.finish",
            vec![Type::own(OUTGOING_BODY), Type::option(Type::own(FIELDS))],
            http_result(None),
        ),
        types(
            &method("future-incoming-response", "subscribe"),
            vec![Type::borrow(FUTURE_INCOMING_RESPONSE)],
            Some(Type::own(POLLABLE)),
        ),
        types(
            &method("future-incoming-response", "get"),
            vec![Type::borrow(FUTURE_INCOMING_RESPONSE)],
            Some(Type::option(Type::result(
                Some(Type::result(
                    Some(Type::own(INCOMING_RESPONSE)),
                    Some(ErrorCode::ty()),
                )),
                None,
            ))),
        ),
    ]);

    ops.push(Operation::new(
        OUTGOING_HANDLER_INTERFACE,
        "handle",
        [
            Type::own(OUTGOING_REQUEST),
            Type::option(Type::own(REQUEST_OPTIONS)),
        ],
        http_result(Some(Type::own(FUTURE_INCOMING_RESPONSE))),
    ));
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::ComponentParams;
    use crate::memory::{LiftContext, LowerContext, VecGuest};
    use crate::resources::{HostResource, Resource};

    struct Request;
    struct Options;
    struct FutureResponse;

    impl HostResource for Request {
        const KIND: ResourceKind = OUTGOING_REQUEST;
    }

    impl HostResource for Options {
        const KIND: ResourceKind = REQUEST_OPTIONS;
    }

    impl HostResource for FutureResponse {
        const KIND: ResourceKind = FUTURE_INCOMING_RESPONSE;
    }

    fn store_and_load(code: ErrorCode) -> (Vec<u8>, ErrorCode) {
        let ty = ErrorCode::ty();
        let mut guest = VecGuest::new(256, ());
        let mut cx = LowerContext::new(&mut guest);
        let ptr = cx.realloc(0, 0, ty.abi().align32, ty.abi().size32).unwrap();
        code.into_val().store(&mut cx, &ty, ptr).unwrap();
        let bytes = guest.bytes()[ptr as usize..][..ty.abi().size32 as usize].to_vec();
        let mut cx = LiftContext::new(&mut guest);
        let val = Val::load(&mut cx, &ty, ptr).unwrap();
        (bytes, ErrorCode::from_val(val).unwrap())
    }

    #[test]
    fn error_code_matches_descriptor() {
        assert!(ErrorCode::typecheck(&ErrorCode::ty()).is_ok());
        let Type::Variant(variant) = ErrorCode::ty() else {
            unreachable!()
        };
        assert_eq!(variant.cases.len(), 39);
        assert_eq!(
            variant.cases.get_index_of("destination-not-found"),
            Some(2)
        );
        assert!(ErrorCode::typecheck(&HeaderError::ty()).is_err());
    }

    #[test]
    fn payload_free_case_has_zero_payload() {
        let (bytes, code) = store_and_load(ErrorCode::DestinationNotFound);
        assert_eq!(code, ErrorCode::DestinationNotFound);
        assert_eq!(bytes[0], 2);
        assert!(bytes[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn payloads_survive_memory() {
        let codes = [
            ErrorCode::DnsError(DnsErrorPayload {
                rcode: Some("NXDOMAIN".into()),
                info_code: Some(3),
            }),
            ErrorCode::HttpRequestHeaderSize(Some(FieldSizePayload {
                field_name: Some("cookie".into()),
                field_size: None,
            })),
            ErrorCode::HttpResponseTrailerSize(FieldSizePayload::default()),
            ErrorCode::InternalError(Some("boom".into())),
            ErrorCode::HttpRequestBodySize(Some(u64::MAX)),
        ];
        for code in codes {
            assert_eq!(store_and_load(code.clone()).1, code);
        }
    }

    #[test]
    fn case_names_keep_their_casing() {
        assert_eq!(ErrorCode::DnsTimeout.name(), "DNS-timeout");
        assert_eq!(ErrorCode::HttpRequestUriTooLong.name(), "HTTP-request-URI-too-long");
        assert_eq!(ErrorCode::InternalError(None).name(), "internal-error");
        assert_eq!(
            ErrorCode::InternalError(Some("x".into())).to_string(),
            "internal-error: x"
        );
        let val = Val::Variant("DNS-timeout".into(), Some(Box::new(Val::U32(1))));
        assert!(ErrorCode::from_val(val).is_err());
    }

    #[test]
    fn methods_and_schemes() {
        assert!(Method::typecheck(&Method::ty()).is_ok());
        assert!(Scheme::typecheck(&Scheme::ty()).is_ok());
        let other = Method::Other("PURGE".into());
        assert_eq!(Method::from_val(other.clone().into_val()).unwrap(), other);
        assert_eq!(Method::Get.into_val(), Val::Variant("get".into(), None));
        assert_eq!(Scheme::Https.into_val(), Val::Variant("HTTPS".into(), None));
        assert_eq!(Scheme::from_val(Scheme::Http.into_val()).unwrap(), Scheme::Http);
        assert_eq!(Method::Patch.to_string(), "PATCH");
    }

    #[test]
    fn header_errors() {
        assert!(HeaderError::typecheck(&HeaderError::ty()).is_ok());
        let val = HeaderError::Immutable.into_val();
        assert_eq!(HeaderError::from_val(val).unwrap(), HeaderError::Immutable);
    }

    #[test]
    fn handle_signature() {
        let op = crate::wasi::operation(OUTGOING_HANDLER_INTERFACE, "handle").unwrap();
        let sig = op.signature();
        assert_eq!(sig.params.len(), 4, "own, option discriminant + payload, retptr");
        assert!(sig.results_indirect);
        assert!(
            <(Resource<Request>, Option<Resource<Options>>)>::typecheck_params(&op.ty.params)
                .is_ok()
        );
        assert!(
            <(Resource<Options>, Option<Resource<Request>>)>::typecheck_params(&op.ty.params)
                .is_err()
        );
        let result = op.ty.result.as_ref().unwrap();
        assert!(<Result<Resource<FutureResponse>, ErrorCode>>::typecheck(result).is_ok());
    }
}
