//! 租户凭证工具
//!
//! 凭证既用于认证也用于选择租户。租户标识取 SHA-256 摘要的前
//! 128 位，渲染为 32 个小写十六进制字符。

use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// 计算租户哈希
pub fn tenant_hash(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    hex::encode(&digest[..16])
}

/// 常数时间比较两个凭证，防止计时侧信道
pub fn credential_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// 生成随机 32 位十六进制访问令牌
pub fn generate_token() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
