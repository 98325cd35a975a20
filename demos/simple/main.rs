use std::time::Duration;

use togglr::{ClientConfig, EvaluationContext};

pub fn main() -> togglr::Result<()> {
    env_logger::init();

    let endpoint_url = std::env::var("TOGGLR_ENDPOINT_URL")
        .unwrap_or_else(|_| "http://localhost:8080/api/templates".to_owned());
    let api_token = std::env::var("TOGGLR_API_TOKEN").unwrap_or_default();

    let client = ClientConfig::new(endpoint_url, api_token, "production")
        .polling_interval(Duration::from_secs(15))
        .to_client()?;

    // Fetch the template and start polling. Until a template is available, evaluation serves
    // fallback values.
    if let Err(err) = client.initialize() {
        println!("Initial fetch failed: {err}");
    }
    let _ = client.wait_for_template(Duration::from_secs(5));

    let context = EvaluationContext::default()
        .with_user_id("test-user")
        .with_app_name("demo")
        .with_property("country", "NO");

    let result = client.evaluate("new-checkout", &context);
    println!(
        "new-checkout: enabled={} reason={:?} variant={}",
        result.enabled, result.reason, result.variant.name
    );

    let color = client.get_value("checkout-button", "grey", &context);
    println!("checkout-button: {color}");

    client.destroy()
}
