use kitops_lib::{Digest, Reference, SubReference};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use simple_test_case::test_case;

#[test_case("ghcr.io/jozu/llama3:latest", Reference::builder().registry("ghcr.io").repository("jozu/llama3").tag("latest").build(); "tagged_remote")]
#[test_case("ghcr.io/jozu/llama3@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4", Reference::builder().registry("ghcr.io").repository("jozu/llama3").digest(kitops_lib::digest!("a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4")).build(); "pinned_remote")]
#[test_case("jozu/llama3", Reference::builder().repository("jozu/llama3").build(); "bare_local")]
#[test_case("my-model:v1", Reference::builder().repository("my-model").tag("v1").build(); "tagged_local")]
#[test]
fn parse(input: &str, expected: Reference) {
    let reference = input.parse::<Reference>().expect("parse reference");
    self::assert_eq!(reference, expected);
}

#[test_case(""; "empty")]
#[test_case("ghcr.io/"; "no_repository")]
#[test_case("ghcr.io//double"; "empty_segment")]
#[test_case("ghcr.io/../up"; "dotdot_segment")]
#[test_case("ghcr.io/repo@notadigest"; "bad_digest")]
#[test]
fn invalid_references(input: &str) {
    let _ = input.parse::<Reference>().expect_err("must error");
}

fn host_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]*(\\.[a-z0-9-]+)*\\.[a-z]{2,4}"
        .prop_filter("valid hostname required", |s| !s.contains(".."))
}

fn repository_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]*/[a-z][a-z0-9-]*"
}

fn tag_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9._-]{0,127}"
}

fn digest_strategy() -> impl Strategy<Value = String> {
    "sha256:[a-f0-9]{64}"
}

fn reference_strategy() -> impl Strategy<Value = Reference> {
    (
        host_strategy(),
        repository_strategy(),
        prop_oneof![
            Just(SubReference::Bare),
            tag_strategy().prop_map(SubReference::Tag),
            digest_strategy().prop_map(|digest| {
                SubReference::Digest(digest.parse::<Digest>().expect("parse digest"))
            })
        ],
    )
        .prop_map(|(registry, repository, sub_reference)| Reference {
            registry,
            repository,
            sub_reference,
        })
}

proptest! {
    // Property: formatting then parsing a reference yields the original.
    #[test]
    fn round_trip_format_parse(reference in reference_strategy()) {
        let formatted = reference.to_string();
        let parsed = formatted.parse::<Reference>().expect("parse formatted reference");
        prop_assert_eq!(reference, parsed);
    }

    // Property: references without a registry-shaped head stay local.
    #[test]
    fn headless_references_are_local(repository in repository_strategy(), tag in tag_strategy()) {
        let reference = format!("{repository}:{tag}").parse::<Reference>().expect("parse");
        prop_assert!(reference.is_local());
    }

    // Property: only digest sub-references validate as digests.
    #[test]
    fn digest_validation(reference in reference_strategy()) {
        let is_digest = matches!(reference.sub_reference, SubReference::Digest(_));
        prop_assert_eq!(reference.as_digest().is_ok(), is_digest);
    }
}
