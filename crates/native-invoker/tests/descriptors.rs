//! JSON descriptors through to generated stubs.

use native_invoker::a64::registers::{V0, V1, X0, X1, X2};
use native_invoker::descriptor::{RawAbi, RawDowncallSignature, RawLayout};
use native_invoker::test_harness::downcall_stub;
use native_invoker::{
    AbiDescriptor, BufferLayout, DowncallSignature, Error, HeapCodeAllocator, Location,
    StandardRuntime, TrustCriterion, ValueType, generate_adapter, make_native_invoker,
};

const ABI: &str = r#"{
    "input_storage": {
        "integer": [{ "type": 0, "index": 0 }, { "type": 0, "index": 1 }, { "type": 0, "index": 2 }],
        "vector": [{ "type": 1, "index": 0 }, { "type": 1, "index": 1 }]
    },
    "output_storage": {
        "integer": [{ "type": 0, "index": 0 }],
        "vector": [{ "type": 1, "index": 0 }]
    },
    "volatile_storage": {
        "integer": [{ "type": 0, "index": 9 }]
    },
    "stack_alignment": 16
}"#;

const LAYOUT: &str = r#"{
    "stack_args_bytes": 0,
    "stack_args": 8,
    "arguments_next_pc": 16,
    "input_type_offsets": [24, 80],
    "output_type_offsets": [112, 128],
    "size": 144
}"#;

fn parse_abi(json: &str) -> Result<AbiDescriptor, Error> {
    let raw: RawAbi = serde_json::from_str(json).unwrap();
    AbiDescriptor::try_from(raw)
}

#[test]
fn abi_and_layout_parse_and_generate() {
    let abi = parse_abi(ABI).unwrap();
    assert_eq!(abi.integer_args, vec![X0, X1, X2]);
    assert_eq!(abi.vector_args, vec![V0, V1]);
    assert_eq!(abi.shadow_space, 0);
    assert!(abi.is_volatile(Location::Gpr(X1)));
    assert!(abi.is_volatile(Location::Gpr(native_invoker::abi::TMP1)));
    assert!(!abi.is_volatile(Location::Stack(0)));

    let raw: RawLayout = serde_json::from_str(LAYOUT).unwrap();
    let layout = BufferLayout::try_from(raw).unwrap();
    assert_eq!(layout.arguments_vector, 80);
    assert_eq!(layout.vector_return_offset(0), 128);

    let mut alloc = HeapCodeAllocator::default();
    let stub =
        generate_adapter(&abi, &layout, TrustCriterion::NonBlockingLeaf, &mut alloc).unwrap();
    assert_eq!(stub.frame_size_bytes(), 32);
    assert_eq!(alloc.regions().len(), 1);
}

#[test]
fn wrong_register_class_is_rejected() {
    let json = ABI.replacen(r#""type": 1, "index": 0 }, { "type": 1"#, r#""type": 0, "index": 0 }, { "type": 1"#, 1);
    assert!(matches!(parse_abi(&json), Err(Error::Descriptor(_))));

    let json = ABI.replace(r#""stack_alignment": 16"#, r#""stack_alignment": 12"#);
    assert!(matches!(parse_abi(&json), Err(Error::Descriptor(_))));
}

#[test]
fn downcall_signature_parses_and_generates() {
    let json = r#"{
        "arg_types": ["long", "int", "double", "long"],
        "return_type": "float",
        "input_locations": [
            { "type": 0, "index": 0 },
            { "type": 1, "index": 0 },
            { "type": 3, "index": 1 }
        ],
        "output_locations": [{ "type": 1, "index": 0 }, { "type": 7, "index": 0 }]
    }"#;
    let raw: RawDowncallSignature = serde_json::from_str(json).unwrap();
    let sig = DowncallSignature::try_from(raw).unwrap();
    assert_eq!(sig.arg_types[2], ValueType::Double);
    assert_eq!(sig.input_locations[2], Location::Stack(8));
    assert_eq!(sig.output_locations, vec![Location::Fpr(V0), Location::Bad]);
    assert_eq!(sig.output_location(), Location::Fpr(V0));

    let stub = downcall_stub(&sig).unwrap();
    // One outgoing slot at 8 rounds to 16, plus a 16-byte vector spill slot.
    assert_eq!(stub.frame_size_bytes(), 48);
}

#[test]
fn out_of_range_register_is_rejected() {
    let json = r#"{
        "arg_types": ["long", "long"],
        "return_type": "void",
        "input_locations": [{ "type": 0, "index": 40 }]
    }"#;
    let raw: RawDowncallSignature = serde_json::from_str(json).unwrap();
    assert!(matches!(
        DowncallSignature::try_from(raw),
        Err(Error::Descriptor(_))
    ));
}

#[test]
fn huge_stack_index_fails_without_reserving_code() {
    let json = r#"{
        "arg_types": ["long", "long"],
        "return_type": "long",
        "input_locations": [{ "type": 3, "index": 536870908 }],
        "output_locations": [{ "type": 0, "index": 0 }]
    }"#;
    let raw: RawDowncallSignature = serde_json::from_str(json).unwrap();
    let sig = DowncallSignature::try_from(raw).unwrap();
    assert_eq!(sig.input_locations[0], Location::Stack(u32::MAX - 31));

    let mut alloc = HeapCodeAllocator::default();
    let result = make_native_invoker(&sig, &StandardRuntime::default(), &mut alloc);
    assert!(matches!(result, Err(Error::ImmediateOutOfRange { .. })));
    assert!(alloc.regions().is_empty());
}
