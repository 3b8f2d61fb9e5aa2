//! Instance identifier grammar, exercised as a parametrized table rather
//! than one function per case.

use proxy::InstanceId;
use rstest::rstest;

#[rstest]
#[case("projects/p/locations/r/clusters/c/instances/i")]
#[case("projects/my-project/locations/us-central1/clusters/main/instances/primary")]
#[case("projects/legacy:proj/locations/r/clusters/c/instances/i")]
fn accepts_well_formed_identifiers(#[case] input: &str) {
    assert!(InstanceId::parse(input).is_ok(), "expected {input:?} to parse");
}

#[rstest]
#[case("projects/p/locations/r/clusters/c/instances/")]
#[case("projects//locations/r/clusters/c/instances/i")]
#[case("projects/p/locations/r/clusters/c")]
#[case("projects/p/locations//clusters/c/instances/i")]
#[case("not-even-close")]
#[case("")]
#[case("projects/p/locations/r/clusters/c/instances/i/extra")]
fn rejects_malformed_identifiers(#[case] input: &str) {
    assert!(InstanceId::parse(input).is_err(), "expected {input:?} to be rejected");
}

#[rstest]
#[case("proj.region.clust.inst")]
#[case("a.b.c.d")]
#[case("legacy_proj.region.clust.inst")]
fn short_form_accepts_four_nonempty_segments(#[case] input: &str) {
    assert!(
        InstanceId::from_short_form(input).is_ok(),
        "expected {input:?} to parse as a short form"
    );
}

#[rstest]
#[case(".region.clust.inst")]
#[case("proj..clust.inst")]
#[case("proj.region.clust.")]
#[case("proj.region.clust")]
fn short_form_rejects_empty_segments_and_leading_dot(#[case] input: &str) {
    assert!(
        InstanceId::from_short_form(input).is_err(),
        "expected {input:?} to be rejected"
    );
}

#[rstest]
#[case(
    "projects/proj/locations/region/clusters/clust/instances/inst",
    "proj.region.clust.inst"
)]
#[case(
    "projects/my:legacy/locations/region/clusters/clust/instances/inst",
    "my_legacy.region.clust.inst"
)]
fn full_and_short_forms_correspond(#[case] full: &str, #[case] expected_short: &str) {
    let id = InstanceId::parse(full).unwrap();
    assert_eq!(id.short_form(), expected_short);
    assert_eq!(InstanceId::from_short_form(expected_short).unwrap(), id);
}
