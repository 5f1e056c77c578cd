//! Decoding of loosely-typed request bags handed over by script-backed rules.
//!
//! Every field is coerced on its own. A field whose JSON shape does not match
//! is skipped and the field keeps its zero value; only a missing or
//! non-string `Url` rejects the whole bag.

use super::{Request, Timeout};
use http::{HeaderName, HeaderValue};
use serde_json::{Map, Value};
use std::time::Duration;

impl Request {
    /// Builds a request from a dynamic parameter bag.
    ///
    /// Recognized keys: `Url`, `Rule`, `Method`, `Header`, `PostData`,
    /// `Reloadable`, `DialTimeout`, `ConnTimeout`, `RetryPause` (nanoseconds),
    /// `TryTimes`, `RedirectTimes`, `Priority`, `DownloaderID` and `Temp`.
    pub fn from_dynamic(bag: &Value) -> Option<Request> {
        let bag = bag.as_object()?;
        let url = bag.get("Url")?.as_str()?;

        let mut req = Request::new(url, string_field(bag, "Rule").unwrap_or_default());
        req.method = string_field(bag, "Method").unwrap_or_default();
        if let Some(Value::Object(header)) = bag.get("Header") {
            for (name, values) in header {
                let Some(values) = string_list(values) else {
                    continue;
                };
                let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                    continue;
                };
                for value in values {
                    if let Ok(value) = HeaderValue::from_str(value) {
                        req.header.append(name.clone(), value);
                    }
                }
            }
        }
        req.post_data = string_field(bag, "PostData").unwrap_or_default();
        req.reloadable = bag
            .get("Reloadable")
            .and_then(Value::as_bool)
            .unwrap_or_default();
        if let Some(nanos) = int_field(bag, "DialTimeout") {
            req.dial_timeout = Timeout::from_nanos(nanos);
        }
        if let Some(nanos) = int_field(bag, "ConnTimeout") {
            req.conn_timeout = Timeout::from_nanos(nanos);
        }
        if let Some(nanos) = int_field(bag, "RetryPause") {
            req.retry_pause = u64::try_from(nanos).ok().map(Duration::from_nanos);
        }
        if let Some(n) = int_field(bag, "TryTimes") {
            req.try_times = clamp_i32(n);
        }
        if let Some(n) = int_field(bag, "RedirectTimes") {
            req.redirect_times = clamp_i32(n);
        }
        if let Some(n) = int_field(bag, "Priority") {
            req.priority = clamp_i32(n);
        }
        if let Some(n) = int_field(bag, "DownloaderID") {
            req.downloader_id = clamp_i32(n);
        }
        if let Some(Value::Object(temp)) = bag.get("Temp") {
            req.temp = temp.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }
        Some(req)
    }
}

fn string_field(bag: &Map<String, Value>, key: &str) -> Option<String> {
    bag.get(key).and_then(Value::as_str).map(str::to_string)
}

fn int_field(bag: &Map<String, Value>, key: &str) -> Option<i64> {
    bag.get(key).and_then(Value::as_i64)
}

fn string_list(value: &Value) -> Option<Vec<&str>> {
    value.as_array()?.iter().map(Value::as_str).collect()
}

fn clamp_i32(n: i64) -> i32 {
    n.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_well_shaped_bag() {
        let bag = json!({
            "Url": "http://x.test/p?id=1",
            "Rule": "detail",
            "Method": "post",
            "Header": {"Accept": ["text/html", "application/xhtml+xml"]},
            "PostData": "a=1",
            "Reloadable": true,
            "DialTimeout": 5_000_000_000i64,
            "ConnTimeout": -1,
            "RetryPause": 1_000_000,
            "TryTimes": 5,
            "RedirectTimes": -1,
            "Priority": 2,
            "DownloaderID": 1,
            "Temp": {"page": 2}
        });
        let req = Request::from_dynamic(&bag).unwrap();

        assert_eq!(req.url, "http://x.test/p?id=1");
        assert_eq!(req.rule, "detail");
        assert_eq!(req.method, "post");
        assert_eq!(req.header.get_all("accept").iter().count(), 2);
        assert_eq!(req.post_data, "a=1");
        assert!(req.reloadable);
        assert_eq!(req.dial_timeout, Timeout::After(Duration::from_secs(5)));
        assert_eq!(req.conn_timeout, Timeout::Unlimited);
        assert_eq!(req.retry_pause, Some(Duration::from_millis(1)));
        assert_eq!(req.try_times, 5);
        assert_eq!(req.redirect_times, -1);
        assert_eq!(req.priority, 2);
        assert_eq!(req.downloader_id, 1);
        assert_eq!(req.get_temp::<i64>("page"), Some(2));
    }

    #[test]
    fn mismatched_shapes_are_skipped() {
        let bag = json!({
            "Url": "http://x.test/",
            "Rule": 7,
            "Header": {"Accept": "text/html", "X-Ok": ["1"], "X-Mixed": ["a", 2]},
            "Reloadable": "yes",
            "TryTimes": "3",
            "Priority": 1.5,
            "Temp": ["not", "a", "map"]
        });
        let req = Request::from_dynamic(&bag).unwrap();

        assert_eq!(req.rule, "");
        assert!(req.header.get("accept").is_none());
        assert!(req.header.get("x-mixed").is_none());
        assert_eq!(req.header.get("x-ok").unwrap().to_str().unwrap(), "1");
        assert!(!req.reloadable);
        assert_eq!(req.try_times, 0);
        assert_eq!(req.priority, 0);
        assert!(req.temp.is_empty());
    }

    #[test]
    fn bag_without_string_url_is_rejected() {
        assert!(Request::from_dynamic(&json!({"Rule": "list"})).is_none());
        assert!(Request::from_dynamic(&json!({"Url": 42})).is_none());
        assert!(Request::from_dynamic(&json!("http://x.test/")).is_none());
    }
}
