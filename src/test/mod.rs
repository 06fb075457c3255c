//! Fixtures shared by the unit tests.

use std::sync::Arc;

use crate::{
    metadata::{
        method::{MethodDescriptor, MethodDescriptorRc, TypeRef},
        signature::{MethodSignature, TypeSignature},
        token::Token,
    },
    patch::{PatchKind, PatchRecord},
    platform::{EmulatedPlatform, HostId, Value},
    resolver::ResolvedMethod,
    Result,
};

/// A host with two static `i4()` methods: `Game.Clock::Now` returning 1 with
/// `code_size` bytes of code, and `Mod.Patches::Now` returning 2. Neither is compiled.
pub fn host_with_pair(
    code_size: usize,
) -> Result<(Arc<EmulatedPlatform>, MethodDescriptorRc, MethodDescriptorRc)> {
    let host = Arc::new(EmulatedPlatform::new()?);
    let clock = host.define_type("Game", "Clock");
    let patches = host.define_type("Mod", "Patches");

    let original = host
        .method(&clock, "Now")
        .returns(TypeSignature::I4)
        .code_size(code_size)
        .body(|_, _| Ok(Value::I32(1)))
        .define()?;
    let replacement = host
        .method(&patches, "Now")
        .returns(TypeSignature::I4)
        .body(|_, _| Ok(Value::I32(2)))
        .define()?;

    Ok((host, original, replacement))
}

/// A handle to a method whose entry point is not known yet.
pub fn resolved(descriptor: &MethodDescriptorRc) -> ResolvedMethod {
    ResolvedMethod::new(descriptor.clone(), None)
}

/// A record of `source -> target` on `host` that was never written anywhere.
pub fn fake_record(host: HostId, source: Token, target: Token) -> PatchRecord {
    let owner = TypeRef::new(Token::type_def(1), "", "Fake");
    let method = |token: Token| {
        Arc::new(MethodDescriptor::new(
            token,
            owner.clone(),
            format!("m{}", token.row()),
            MethodSignature::default(),
        ))
    };

    PatchRecord::new(
        host,
        resolved(&method(source)),
        resolved(&method(target)),
        PatchKind::EntryJump,
        0x1000 + u64::from(source.row()) * 0x10,
        vec![0x55],
        vec![0xE9],
    )
}
