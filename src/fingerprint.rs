//! 客户端指纹
//!
//! 认证前拿不到可靠的账号身份，只能用请求里可见的网络/头部属性识别客户端。
//! 指纹是加盐 SHA-256，不可逆，日志里只打印前 16 位。

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;

/// 可信代理头，按优先级排列
const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_CLIENT_FINGERPRINT: &str = "x-client-fingerprint";

const DELIMITER: &str = "|";
const LOG_PREFIX_LEN: usize = 16;
const DIGEST_HEX_LEN: usize = 64;

/// 参与指纹计算的请求属性，缺失的一律为空串
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    pub ip: String,
    pub user_agent: String,
    pub accept_language: String,
    pub accept_encoding: String,
    /// 前端可选上报的 `x-client-fingerprint`
    pub client_hint: String,
}

impl RequestAttributes {
    pub fn from_request(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        Self {
            ip: client_ip(headers, peer),
            user_agent: header_str(headers, "user-agent").to_string(),
            accept_language: header_str(headers, "accept-language").to_string(),
            accept_encoding: header_str(headers, "accept-encoding").to_string(),
            client_hint: header_str(headers, X_CLIENT_FINGERPRINT).to_string(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// 解析客户端真实 IP
///
/// 优先级：CF-Connecting-IP > X-Real-IP > X-Forwarded-For（第一个）> 套接字地址
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let first_entry = |name: &str| {
        header_str(headers, name)
            .split(',')
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    first_entry(CF_CONNECTING_IP)
        .or_else(|| {
            Some(header_str(headers, X_REAL_IP).trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .or_else(|| first_entry(X_FORWARDED_FOR))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// 按字符（而非字节）截断，避免切到多字节字符中间
fn prefix(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// 不透明的客户端指纹（64 位十六进制）
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// 从十六进制串还原（管理接口使用），格式不对返回 None
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == DIGEST_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Fingerprint(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 日志用的截断前缀
    pub fn short(&self) -> &str {
        &self.0[..LOG_PREFIX_LEN.min(self.0.len())]
    }
}

// Debug / Display 都只输出前缀，完整指纹不会进日志
impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}…)", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", self.short())
    }
}

/// 指纹生成器，持有进程级的盐
///
/// 盐必须长期固定：轮换会让所有客户端的历史记录悄悄清零。
pub struct FingerprintDeriver {
    salt: String,
    accept_language_len: usize,
    accept_encoding_len: usize,
}

impl FingerprintDeriver {
    pub fn new(salt: String, accept_language_len: usize, accept_encoding_len: usize) -> Self {
        Self {
            salt,
            accept_language_len,
            accept_encoding_len,
        }
    }

    pub fn derive(&self, attrs: &RequestAttributes) -> Fingerprint {
        let joined = [
            attrs.ip.as_str(),
            attrs.user_agent.as_str(),
            prefix(&attrs.accept_language, self.accept_language_len),
            prefix(&attrs.accept_encoding, self.accept_encoding_len),
            attrs.client_hint.as_str(),
        ]
        .join(DELIMITER);

        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        hasher.update(self.salt.as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

impl fmt::Debug for FingerprintDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintDeriver")
            .field("salt", &"***")
            .field("accept_language_len", &self.accept_language_len)
            .field("accept_encoding_len", &self.accept_encoding_len)
            .finish()
    }
}
