#![no_main]

use arbitrary::Arbitrary;
use lancet_runner::{Runner, RunnerConfig};
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Arbitrary, Debug)]
struct TemplateFuzzInput {
    url: String,
    method: String,
    data: String,
    opaque: String,
    headers: Vec<(String, String)>,
    input: Vec<(String, Vec<u8>)>,
}

fuzz_target!(|fuzz: TemplateFuzzInput| {
    if fuzz.input.len() > 8 || fuzz.headers.len() > 16 {
        return;
    }

    let mut config = RunnerConfig::new(&fuzz.url);
    config.method = fuzz.method;
    config.data = fuzz.data;
    config.opaque = fuzz.opaque;
    config.headers = fuzz.headers.into_iter().collect();
    // never proxy, never touch the network
    config.proxy_url = "http://127.0.0.1:1".to_string();

    let runner = Runner::new(Arc::new(config), false);
    let input: HashMap<String, Vec<u8>> = fuzz.input.into_iter().collect();

    // Prepare never fails, whatever the template looks like
    let request = runner.prepare(&input).expect("prepare must not fail");
    assert_eq!(request.input, input);
});
