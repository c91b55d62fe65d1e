use kitops_lib::mediatype::{
    BaseType, Compression, Format, MediaType, KIT_CONFIG_MEDIA_TYPE, MODELPACK_CONFIG_MEDIA_TYPE,
};
use proptest::prelude::*;

fn base_strategy() -> impl Strategy<Value = BaseType> {
    prop_oneof![
        Just(BaseType::Model),
        Just(BaseType::ModelPart),
        Just(BaseType::Dataset),
        Just(BaseType::Code),
        Just(BaseType::Docs),
    ]
}

fn compression_strategy() -> impl Strategy<Value = Compression> {
    // GzipFastest is excluded on purpose: its wire form is plain gzip.
    prop_oneof![
        Just(Compression::None),
        Just(Compression::Gzip),
        Just(Compression::Zstd),
    ]
}

fn media_type_strategy() -> impl Strategy<Value = MediaType> {
    prop_oneof![
        Just(MediaType::KitConfig),
        Just(MediaType::ModelPackConfig),
        (base_strategy(), compression_strategy())
            .prop_map(|(base, compression)| MediaType::kit(base, compression)),
        (base_strategy(), compression_strategy())
            .prop_map(|(base, compression)| MediaType::modelpack(base, Format::Tar, compression)),
        base_strategy()
            .prop_map(|base| MediaType::modelpack(base, Format::Raw, Compression::None)),
    ]
}

proptest! {
    // Property: every valid media type string parses back to itself.
    #[test]
    fn round_trip_string_parse_string(media_type in media_type_strategy()) {
        let rendered = media_type.to_string();
        let parsed = rendered.parse::<MediaType>().expect("parse rendered media type");
        prop_assert_eq!(parsed.to_string(), rendered);
    }

    // Property: parsing preserves the decomposition.
    #[test]
    fn decomposition_survives_round_trip(media_type in media_type_strategy()) {
        let parsed = media_type.to_string().parse::<MediaType>().expect("parse");
        prop_assert_eq!(parsed.base(), media_type.base());
        prop_assert_eq!(parsed.format(), media_type.format());
        prop_assert_eq!(parsed.compression(), media_type.compression());
    }
}

#[test]
fn config_constants_parse_to_config_base() {
    for constant in [KIT_CONFIG_MEDIA_TYPE, MODELPACK_CONFIG_MEDIA_TYPE] {
        let parsed = constant.parse::<MediaType>().expect("parse config constant");
        assert_eq!(parsed.base(), BaseType::Config);
        assert_eq!(parsed.to_string(), constant);
    }
}
