use chartcheck_core::cache::{cache_key, SamplingParams};

fn params(raw: &str) -> SamplingParams {
    serde_json::from_str(raw).unwrap()
}

#[test]
fn reordered_parameters_produce_the_same_key() {
    let a = params(r#"{"max_tokens":4000,"temperature":0.0,"top_p":0.9,"stop":["\n\n"]}"#);
    let b = params(r#"{"stop":["\n\n"],"top_p":0.9,"temperature":0.0,"max_tokens":4000}"#);
    assert_eq!(
        cache_key("p", Some("s"), &a, "m"),
        cache_key("p", Some("s"), &b, "m")
    );
}

#[test]
fn numerically_equal_temperatures_share_a_key() {
    let a = params(r#"{"max_tokens":10,"temperature":0}"#);
    let b = SamplingParams::new(10, 0.0);
    assert_eq!(cache_key("p", None, &a, "m"), cache_key("p", None, &b, "m"));
}

#[test]
fn every_input_changes_the_key() {
    let p = SamplingParams::new(4000, 0.0);
    let base = cache_key("prompt", Some("system"), &p, "model-a");

    assert_ne!(base, cache_key("prompt ", Some("system"), &p, "model-a"));
    assert_ne!(base, cache_key("prompt", Some("system2"), &p, "model-a"));
    assert_ne!(base, cache_key("prompt", None, &p, "model-a"));
    assert_ne!(base, cache_key("prompt", Some("system"), &p, "model-b"));
    assert_ne!(
        base,
        cache_key("prompt", Some("system"), &SamplingParams::new(4001, 0.0), "model-a")
    );
    assert_ne!(
        base,
        cache_key("prompt", Some("system"), &SamplingParams::new(4000, 0.2), "model-a")
    );
}

#[test]
fn absent_and_empty_system_text_differ() {
    let p = SamplingParams::new(1, 0.0);
    assert_ne!(cache_key("x", None, &p, "m"), cache_key("x", Some(""), &p, "m"));
}

#[test]
fn field_boundaries_are_unambiguous() {
    let p = SamplingParams::new(1, 0.0);
    assert_ne!(
        cache_key("ab", Some("c"), &p, "m"),
        cache_key("a", Some("bc"), &p, "m")
    );
}
