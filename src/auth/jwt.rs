use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

/// JWT 使用的算法（明确指定，避免依赖默认值）
const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,      // username
    pub exp: usize,       // 过期时间 (Unix timestamp)
}

/// 登录成功后签发访问令牌（演示用的凭证下游）
pub struct JwtService {
    secret: String,
    ttl_seconds: i64,
}

impl JwtService {
    pub fn new(secret: String, ttl_seconds: u64) -> Result<Self, String> {
        let ttl_i64 = i64::try_from(ttl_seconds)
            .map_err(|_| "TTL时间溢出：超过i64最大值".to_string())?;

        if ttl_i64 <= 0 {
            return Err("TTL时间必须大于0".to_string());
        }

        if secret.is_empty() {
            return Err("JWT 密钥不能为空".to_string());
        }

        Ok(Self {
            secret,
            ttl_seconds: ttl_i64,
        })
    }

    /// 生成 JWT token
    pub fn generate_token(&self, username: &str) -> anyhow::Result<String> {
        let expiration = Utc::now()
            .checked_add_signed(Duration::seconds(self.ttl_seconds))
            .ok_or_else(|| anyhow::anyhow!("时间计算溢出"))?
            .timestamp();

        let exp_usize = usize::try_from(expiration)
            .map_err(|_| anyhow::anyhow!("过期时间转换失败"))?;

        let claims = Claims {
            sub: username.to_string(),
            exp: exp_usize,
        };

        let token = encode(
            &Header::new(JWT_ALGORITHM),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// 获取 token 有效期（秒）
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds as u64
    }
}
