use ocimod_lib::Platform;
use simple_test_case::test_case;

#[test_case("linux/amd64", Platform::linux_amd64(); "linux/amd64")]
#[test_case("linux/arm64/v8", Platform::linux_arm64().with_variant("v8"); "linux/arm64/v8")]
#[test_case("darwin/arm64", Platform::macos_arm64(); "darwin/arm64")]
#[test_case("windows/amd64", Platform::windows_amd64(); "windows/amd64")]
#[test]
fn parse(input: &str, expected: Platform) {
    let platform = input.parse::<Platform>().unwrap();
    pretty_assertions::assert_eq!(platform, expected);
}

#[test_case("linux"; "linux")]
#[test_case("linux/"; "linux/")]
#[test_case("/arm64/v8"; "/arm64/v8")]
#[test_case("/amd64"; "/amd64")]
#[test_case("linux/amd64/v8/extra"; "linux/amd64/v8/extra")]
#[test]
fn parse_invalid(input: &str) {
    let parsed = input.parse::<Platform>();
    let _ = parsed.expect_err("must error");
}

#[test_case(Platform::linux_amd64(), "linux/amd64"; "linux/amd64")]
#[test_case(Platform::linux_arm64(), "linux/arm64"; "linux/arm64")]
#[test_case(Platform::linux_arm64().with_variant("v8"), "linux/arm64/v8"; "linux/arm64/v8")]
#[test_case(Platform::windows_amd64(), "windows/amd64"; "windows/amd64")]
#[test_case(Platform::macos_arm64(), "darwin/arm64"; "darwin/arm64")]
#[test]
fn display(platform: Platform, expected: &str) {
    pretty_assertions::assert_eq!(platform.to_string(), expected);
}

#[test_case("linux/arm64/v8", "linux/arm64"; "arm64 default variant")]
#[test_case("linux/x86_64", "linux/amd64"; "x86_64 alias")]
#[test_case("linux/aarch64", "linux/arm64"; "aarch64 alias")]
#[test_case("linux/arm", "linux/arm/v7"; "arm default variant")]
#[test_case("linux/amd64/v1", "linux/amd64"; "amd64 baseline variant")]
#[test]
fn normalized(input: &str, expected: &str) {
    let platform = input.parse::<Platform>().unwrap();
    pretty_assertions::assert_eq!(platform.normalized().to_string(), expected);
}

#[test_case("linux/arm64/v8", "linux/arm64", true; "normalized variant")]
#[test_case("linux/amd64", "linux/arm64", false; "different architecture")]
#[test_case("linux/amd64", "windows/amd64", false; "different os")]
#[test_case("linux/arm/v7", "linux/arm", true; "arm default")]
#[test]
fn matches(a: &str, b: &str, expected: bool) {
    let (a, b) = (a.parse::<Platform>().unwrap(), b.parse::<Platform>().unwrap());
    pretty_assertions::assert_eq!(a.matches(&b), expected);
    pretty_assertions::assert_eq!(b.matches(&a), expected);
}

#[test_case("linux/amd64", "linux/amd64", true; "identical")]
#[test_case("linux/amd64/v3", "linux/amd64", true; "newer variant runs baseline")]
#[test_case("linux/amd64", "linux/amd64/v3", false; "baseline cannot run newer variant")]
#[test_case("linux/arm/v7", "linux/arm/v6", true; "arm v7 runs v6")]
#[test_case("linux/arm/v6", "linux/arm/v7", false; "arm v6 cannot run v7")]
#[test_case("darwin/arm64", "linux/arm64", true; "darwin runs linux")]
#[test_case("linux/arm64", "darwin/arm64", true; "linux runs darwin")]
#[test_case("linux/arm64", "linux/amd64", false; "architecture mismatch")]
#[test_case("windows/amd64", "linux/amd64", false; "windows cannot run linux")]
#[test]
fn compatible(host: &str, target: &str, expected: bool) {
    let (host, target) = (host.parse::<Platform>().unwrap(), target.parse::<Platform>().unwrap());
    pretty_assertions::assert_eq!(host.compatible(&target), expected);
}

#[test]
fn compatible_windows_build() {
    let host = Platform::windows_amd64();
    let host = Platform {
        os_version: Some(String::from("10.0.17763.1234")),
        ..host
    };
    let same_build = Platform {
        os_version: Some(String::from("10.0.17763.5678")),
        ..host.clone()
    };
    let other_build = Platform {
        os_version: Some(String::from("10.0.20348.1")),
        ..host.clone()
    };

    assert!(host.compatible(&same_build));
    assert!(!host.compatible(&other_build));
}

#[test]
fn constructors() {
    assert_eq!(Platform::linux_amd64().to_string(), "linux/amd64");
    assert_eq!(Platform::linux_arm64().to_string(), "linux/arm64");
    assert_eq!(Platform::windows_amd64().to_string(), "windows/amd64");
    assert_eq!(Platform::macos_arm64().to_string(), "darwin/arm64");
}
