use chrono::Utc;

/// Microseconds since the Unix epoch, used to stamp received frames.
pub(crate) fn now_micros() -> u64 {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::now_micros;

    #[test]
    fn test_now_micros_advances() {
        let before = now_micros();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(now_micros() > before);
        // 2020-01-01
        assert!(before > 1_577_836_800_000_000);
    }
}
