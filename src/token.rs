use uuid::Uuid;

const FALLBACK_HOST: &str = "127.0.0.1";

/// ロック所有者を識別するトークンを生成する。
///
/// 形式は `{host}_{pid}_{uuid}`。ホスト名は `HOSTNAME` 環境変数から取得し、
/// 取得できない場合はループバックアドレスを使う。
pub fn generate_token() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_HOST.to_string());
    format!("{}_{}_{}", host, std::process::id(), Uuid::new_v4().simple())
}
