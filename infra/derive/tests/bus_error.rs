#[test]
fn bus_error_ui() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/bus_error_pass.rs");
    t.pass("tests/ui/bus_error_existing_derives.rs");
}
