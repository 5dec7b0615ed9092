use chrono::Utc;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current UTC date in `YYYY-MM-DD` form, the format stamped into
/// `fecha_inicio` and `fecha_final`.
pub fn today_ymd() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
