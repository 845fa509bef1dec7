use dispenser_config::Config;
use rstest::rstest;

#[test]
fn parses_full_document() {
    let toml = r#"
[pins]
motor = [2, 3, 6, 13]
opto_fork = 28
piezo = 27

[dispense]
default_period = 5
max_retries = 2
pill_fall_timeout_ms = 200
interval_ms = 1000

[homing]
max_homing_steps = 9000
max_gap_steps = 120

[uplink]
app_key = "00112233445566778899AABBCCDDEEFF"
port = 8
response_timeout_ms = 2000
join_timeout_ms = 20000
max_at_retries = 5
max_step_retries = 30
max_join_attempts = 10
"#;

    let cfg = Config::from_toml_str(toml).expect("parse + validate");
    assert_eq!(cfg.dispense.default_period, 5);
    assert_eq!(cfg.homing.max_gap_steps, 120);
    assert!(cfg.uplink_enabled());
}

#[rstest]
#[case("[dispense]\ndefault_period = 0\n", "default_period")]
#[case("[dispense]\ndefault_period = 9\n", "default_period")]
#[case("[dispense]\nmax_retries = 0\n", "max_retries")]
#[case("[dispense]\npill_fall_timeout_ms = 0\n", "pill_fall_timeout_ms")]
#[case("[homing]\nmax_homing_steps = 0\n", "non-zero")]
#[case(
    "[homing]\nmax_homing_steps = 100\nmax_gap_steps = 100\n",
    "max_gap_steps"
)]
#[case("[uplink]\napp_key = \"tooshort\"\n", "app_key")]
#[case("[uplink]\napp_key = \"XY112233445566778899AABBCCDDEEZZ\"\n", "app_key")]
#[case("[uplink]\nresponse_timeout_ms = 0\n", "timeouts")]
#[case(
    "[uplink]\nresponse_timeout_ms = 30000\njoin_timeout_ms = 20000\n",
    "must not exceed"
)]
#[case("[uplink]\nmax_at_retries = 0\n", "retry caps")]
fn rejects_out_of_range_fields(#[case] toml: &str, #[case] needle: &str) {
    let err = Config::from_toml_str(toml).expect_err("should fail validation");
    let msg = format!("{err}").to_lowercase();
    assert!(
        msg.contains(&needle.to_lowercase()),
        "error `{msg}` should mention `{needle}`"
    );
}

#[test]
fn empty_app_key_disables_uplink_but_validates() {
    let cfg = Config::from_toml_str("[uplink]\napp_key = \"\"\n").expect("valid");
    assert!(!cfg.uplink_enabled());
}
