//! Integration tests for complete redirection passes against the emulated host.
//!
//! Every test builds its own host, and all but one use a registry of their own. The
//! exception shares the process-wide registry between two hosts, which is safe alongside
//! the others because every host has a distinct identity.

use std::sync::{Arc, Mutex};

use redirection::prelude::*;

struct Host {
    platform: Arc<EmulatedPlatform>,
    game: TypeRef,
    detours: TypeRef,
}

impl Host {
    fn new() -> Result<Self> {
        Self::with_architecture(Architecture::X86_64)
    }

    fn with_architecture(arch: Architecture) -> Result<Self> {
        let platform = Arc::new(EmulatedPlatform::with_architecture(arch)?);
        let game = platform.define_type("Game", "Type1");
        let detours = platform.define_type("Mod", "Type2Helper");
        Ok(Host {
            platform,
            game,
            detours,
        })
    }

    /// Static `i4()` method returning `value`.
    fn constant(&self, ty: &TypeRef, name: &str, value: i32) -> Result<MethodDescriptorRc> {
        self.platform
            .method(ty, name)
            .returns(TypeSignature::I4)
            .body(move |_, _| Ok(Value::I32(value)))
            .define()
    }

    fn redirector(&self, config: RedirectConfig) -> Redirector {
        Redirector::with_config(self.platform.clone(), self.platform.clone(), config)
            .with_registry(Arc::new(RedirectionRegistry::new()))
    }

    fn key(&self, method: &MethodDescriptorRc) -> MethodKey {
        MethodKey::new(self.platform.host_id(), method.token)
    }

    fn call(&self, method: &MethodDescriptorRc) -> Result<Value> {
        self.platform.invoke(method.token, &[])
    }
}

fn from_source(ty: &TypeRef, name: &str) -> Result<RedirectDeclaration> {
    RedirectDeclaration::named_with_kind(RedirectDirection::FromSource, ty.clone(), name, false)
}

/// `Type1.compute(int)` is an instance method; the replacement is the static
/// `Type2Helper.compute_replacement(Type1, int)` taking the receiver explicitly.
#[test]
fn test_instance_method_redirected_to_static_helper() -> Result<()> {
    let host = Host::new()?;
    let compute = host
        .platform
        .method(&host.game, "compute")
        .instance()
        .param(TypeSignature::I4)
        .returns(TypeSignature::I4)
        .body(|_, args| Ok(Value::I32(args[1].as_i32().unwrap_or_default() * 2)))
        .define()?;
    let replacement = host
        .platform
        .method(&host.detours, "compute_replacement")
        .param(TypeSignature::Class(host.game.token))
        .param(TypeSignature::I4)
        .returns(TypeSignature::I4)
        .body(|_, args| {
            assert!(args[0].as_object().is_some(), "receiver is passed first");
            Ok(Value::I32(args[1].as_i32().unwrap_or_default() + 1000))
        })
        .define()?;

    let scope = RedirectScope::new("scenario").redirect(
        &replacement,
        RedirectDeclaration::named(RedirectDirection::FromSource, host.game.clone(), "compute")?,
    );
    let redirector = host.redirector(RedirectConfig::default());
    let args = [Value::Object(0x42), Value::I32(5)];

    assert_eq!(host.platform.invoke(compute.token, &args)?, Value::I32(10));

    let report = redirector.perform_redirections(&scope);
    assert!(report.is_success(), "{report}");
    assert_eq!(
        report.entries[0].outcome,
        RedirectOutcome::Applied(PatchKind::EntryJump)
    );
    assert_eq!(report.entries[0].source, Some(compute.token));
    assert_eq!(host.platform.invoke(compute.token, &args)?, Value::I32(1005));

    let reverted = redirector.revert_redirections(&scope);
    assert_eq!(reverted.reverted(), 1);
    assert_eq!(host.platform.invoke(compute.token, &args)?, Value::I32(10));
    assert!(redirector.registry().is_empty()?);
    Ok(())
}

#[test]
fn test_revert_restores_bytes_exactly() -> Result<()> {
    let host = Host::new()?;
    let original = host
        .platform
        .method(&host.game, "Tick")
        .returns(TypeSignature::I4)
        .eager()
        .body(|_, _| Ok(Value::I32(1)))
        .define()?;
    let replacement = host.constant(&host.detours, "Tick", 2)?;

    let entry = host
        .platform
        .entry_point(original.token)
        .expect("eager methods are compiled on definition");
    let before = host.platform.read_code(entry.address, entry.capacity)?;

    let scope = RedirectScope::new("tick").redirect(&replacement, from_source(&host.game, "Tick")?);
    let redirector = host.redirector(RedirectConfig::default());
    redirector.perform_redirections(&scope);
    assert_ne!(host.platform.read_code(entry.address, entry.capacity)?, before);

    redirector.revert_redirections(&scope);
    assert_eq!(host.platform.read_code(entry.address, entry.capacity)?, before);
    assert_eq!(host.call(&original)?, Value::I32(1));
    Ok(())
}

#[test]
fn test_second_pass_reports_already_patched() -> Result<()> {
    let host = Host::new()?;
    let original = host.constant(&host.game, "Tick", 1)?;
    let replacement = host.constant(&host.detours, "Tick", 2)?;
    let scope = RedirectScope::new("tick").redirect(&replacement, from_source(&host.game, "Tick")?);
    let redirector = host.redirector(RedirectConfig::default());

    assert!(redirector.perform_redirections(&scope).is_success());
    let second = redirector.perform_redirections(&scope);
    assert_eq!(
        second.entries[0].outcome,
        RedirectOutcome::PatchError(PatchErrorKind::AlreadyPatched)
    );

    // The first redirection is intact
    let record = redirector
        .registry()
        .lookup(host.key(&original))?
        .expect("first pass registered the patch");
    assert!(record.is_installed());
    assert_eq!(host.call(&original)?, Value::I32(2));
    Ok(())
}

#[test]
fn test_second_revert_performs_no_write() -> Result<()> {
    let host = Host::new()?;
    let original = host.constant(&host.game, "Tick", 1)?;
    let replacement = host.constant(&host.detours, "Tick", 2)?;
    let scope = RedirectScope::new("tick").redirect(&replacement, from_source(&host.game, "Tick")?);
    let redirector = host.redirector(RedirectConfig::default());

    redirector.perform_redirections(&scope);
    let record = redirector
        .registry()
        .lookup(host.key(&original))?
        .expect("patch is registered");

    assert_eq!(redirector.revert_redirections(&scope).reverted(), 1);
    let writes = host.platform.write_count();

    let again = redirector.revert_redirections(&scope);
    assert_eq!(again.entries[0].outcome, RedirectOutcome::NotActive);
    assert!(!redirector.engine().revert(&record)?);
    assert_eq!(host.platform.write_count(), writes);
    Ok(())
}

#[test]
fn test_one_bad_declaration_does_not_stop_the_others() -> Result<()> {
    let host = Host::new()?;
    let mut scope = RedirectScope::new("batch");
    let mut originals = Vec::new();

    for (index, name) in ["A", "B", "C", "D"].into_iter().enumerate() {
        originals.push(host.constant(&host.game, name, index as i32)?);
        let replacement = host.constant(&host.detours, name, 100 + index as i32)?;
        // The third declaration names a method that does not exist
        let target = if name == "C" { "DoesNotExist" } else { name };
        scope.push(&replacement, from_source(&host.game, target)?);
    }

    let report = host.redirector(RedirectConfig::default()).perform_redirections(&scope);
    assert_eq!(report.applied(), 3);
    assert_eq!(report.failures().count(), 1);
    assert_eq!(
        report.entries[2].outcome,
        RedirectOutcome::LookupError(LookupErrorKind::NotFound)
    );

    assert_eq!(host.call(&originals[0])?, Value::I32(100));
    assert_eq!(host.call(&originals[2])?, Value::I32(2));
    assert_eq!(host.call(&originals[3])?, Value::I32(103));
    Ok(())
}

#[test]
fn test_ambiguous_declaration_is_reported() -> Result<()> {
    let host = Host::new()?;
    host.constant(&host.game, "Tick", 1)?;
    host.constant(&host.game, "Tick", 2)?;
    let replacement = host.constant(&host.detours, "Tick", 3)?;

    let scope = RedirectScope::new("tick").redirect(&replacement, from_source(&host.game, "Tick")?);
    let report = host.redirector(RedirectConfig::default()).perform_redirections(&scope);
    assert_eq!(
        report.entries[0].outcome,
        RedirectOutcome::LookupError(LookupErrorKind::AmbiguousMatch)
    );
    assert_eq!(host.platform.write_count(), 0);
    Ok(())
}

/// A and B replace game methods; C turns a stub into a call-through to B's source. The
/// revert must undo C before B before A.
#[test]
fn test_revert_runs_in_reverse_application_order() -> Result<()> {
    let host = Host::new()?;
    let alpha = host.constant(&host.game, "Alpha", 1)?;
    let beta = host.constant(&host.game, "Beta", 2)?;
    let alpha_patch = host.constant(&host.detours, "Alpha", 10)?;
    let beta_patch = host.constant(&host.detours, "Beta", 20)?;
    let call_beta = host.constant(&host.detours, "CallBeta", 0)?;

    let scope = RedirectScope::new("ordered")
        .redirect(&alpha_patch, from_source(&host.game, "Alpha")?)
        .redirect(&beta_patch, from_source(&host.game, "Beta")?)
        .redirect(
            &call_beta,
            RedirectDeclaration::named_with_kind(
                RedirectDirection::ToSource,
                host.game.clone(),
                "Beta",
                false,
            )?,
        );

    let redirector = host.redirector(RedirectConfig::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    redirector.registry().set_listener(move |event| {
        if let Ok(mut events) = sink.lock() {
            events.push(*event);
        }
    })?;

    let report = redirector.perform_redirections(&scope);
    assert!(report.is_success(), "{report}");
    // The stub calls through to Beta, which itself is redirected
    assert_eq!(host.call(&call_beta)?, Value::I32(20));

    redirector.revert_redirections(&scope);
    let events = events.lock().map_err(|_| Error::LockError)?;
    let removed: Vec<RegistryEvent> = events
        .iter()
        .copied()
        .filter(|event| matches!(event, RegistryEvent::Unregistered(_)))
        .collect();
    assert_eq!(
        removed,
        vec![
            RegistryEvent::Unregistered(host.key(&call_beta)),
            RegistryEvent::Unregistered(host.key(&beta)),
            RegistryEvent::Unregistered(host.key(&alpha)),
        ]
    );
    assert_eq!(host.call(&call_beta)?, Value::I32(0));
    assert_eq!(host.call(&alpha)?, Value::I32(1));
    Ok(())
}

#[test]
fn test_small_virtual_method_falls_back_to_slot() -> Result<()> {
    let host = Host::new()?;
    let area = host
        .platform
        .method(&host.game, "Area")
        .instance()
        .returns(TypeSignature::I4)
        .code_size(3)
        .virtual_slot()
        .body(|_, _| Ok(Value::I32(1)))
        .define()?;
    let replacement = host
        .platform
        .method(&host.detours, "Area")
        .param(TypeSignature::Object)
        .returns(TypeSignature::I4)
        .body(|_, _| Ok(Value::I32(2)))
        .define()?;

    let scope = RedirectScope::new("slots").redirect(
        &replacement,
        RedirectDeclaration::new(RedirectDirection::FromSource, host.game.clone())?,
    );
    let redirector = host.redirector(RedirectConfig::default());

    let report = redirector.perform_redirections(&scope);
    assert_eq!(
        report.entries[0].outcome,
        RedirectOutcome::Applied(PatchKind::SlotSwap)
    );
    assert_eq!(host.platform.invoke(area.token, &[Value::Object(1)])?, Value::I32(2));

    redirector.revert_redirections(&scope);
    assert_eq!(host.platform.invoke(area.token, &[Value::Object(1)])?, Value::I32(1));
    Ok(())
}

#[test]
fn test_small_entry_without_slot_is_rejected() -> Result<()> {
    let host = Host::new()?;
    let original = host
        .platform
        .method(&host.game, "Tiny")
        .returns(TypeSignature::I4)
        .code_size(2)
        .body(|_, _| Ok(Value::I32(1)))
        .define()?;
    let replacement = host.constant(&host.detours, "Tiny", 2)?;

    let scope = RedirectScope::new("tiny").redirect(&replacement, from_source(&host.game, "Tiny")?);
    let report = host.redirector(RedirectConfig::default()).perform_redirections(&scope);

    assert_eq!(
        report.entries[0].outcome,
        RedirectOutcome::PatchError(PatchErrorKind::InsufficientEntrySpace)
    );
    assert_eq!(host.call(&original)?, Value::I32(1));
    Ok(())
}

#[test]
fn test_write_denial_leaves_bytes_untouched() -> Result<()> {
    let host = Host::new()?;
    let original = host.constant(&host.game, "Locked", 1)?;
    let replacement = host.constant(&host.detours, "Locked", 2)?;
    host.platform.deny_method_writes(original.token)?;

    let entry = host
        .platform
        .entry_point(original.token)
        .expect("denying writes compiles the method");
    let before = host.platform.read_code(entry.address, entry.capacity)?;

    let scope = RedirectScope::new("locked").redirect(&replacement, from_source(&host.game, "Locked")?);
    let redirector = host.redirector(RedirectConfig::default());
    let report = redirector.perform_redirections(&scope);

    assert_eq!(
        report.entries[0].outcome,
        RedirectOutcome::PatchError(PatchErrorKind::WritePermissionDenied)
    );
    assert_eq!(host.platform.read_code(entry.address, entry.capacity)?, before);
    assert_eq!(host.platform.write_count(), 0);
    assert!(redirector.registry().is_empty()?);
    Ok(())
}

#[test]
fn test_uncompiled_methods_are_compiled_before_patching() -> Result<()> {
    let host = Host::new()?;
    let original = host.constant(&host.game, "Lazy", 1)?;
    let replacement = host.constant(&host.detours, "Lazy", 2)?;
    assert!(!host.platform.is_compiled(original.token));
    assert!(!host.platform.is_compiled(replacement.token));

    let scope = RedirectScope::new("lazy").redirect(&replacement, from_source(&host.game, "Lazy")?);
    let report = host.redirector(RedirectConfig::default()).perform_redirections(&scope);

    assert!(report.is_success(), "{report}");
    assert!(host.platform.is_compiled(original.token));
    assert!(host.platform.is_compiled(replacement.token));
    assert_eq!(host.call(&original)?, Value::I32(2));
    Ok(())
}

#[test]
fn test_compile_failure_is_reported() -> Result<()> {
    let host = Host::new()?;
    host.platform
        .method(&host.game, "Broken")
        .returns(TypeSignature::I4)
        .compile_fails()
        .define()?;
    let replacement = host.constant(&host.detours, "Broken", 2)?;

    let scope = RedirectScope::new("broken").redirect(&replacement, from_source(&host.game, "Broken")?);
    let report = host.redirector(RedirectConfig::default()).perform_redirections(&scope);

    assert_eq!(
        report.entries[0].outcome,
        RedirectOutcome::PatchError(PatchErrorKind::NotYetCompiled)
    );
    assert!(report.entries[0].message.is_some());
    Ok(())
}

#[test]
fn test_cycle_is_rejected() -> Result<()> {
    let host = Host::new()?;
    let original = host.constant(&host.game, "Loop", 1)?;
    let replacement = host.constant(&host.detours, "Loop", 2)?;

    // Game::Loop -> Mod::Loop, then Mod::Loop -> Game::Loop
    let scope = RedirectScope::new("cycle")
        .redirect(&replacement, from_source(&host.game, "Loop")?)
        .redirect(
            &replacement,
            RedirectDeclaration::named_with_kind(
                RedirectDirection::ToSource,
                host.game.clone(),
                "Loop",
                false,
            )?,
        );
    let report = host.redirector(RedirectConfig::default()).perform_redirections(&scope);

    assert_eq!(
        report.entries[0].outcome,
        RedirectOutcome::Applied(PatchKind::EntryJump)
    );
    assert_eq!(
        report.entries[1].outcome,
        RedirectOutcome::PatchError(PatchErrorKind::RedirectCycle)
    );
    assert_eq!(host.call(&original)?, Value::I32(2));
    Ok(())
}

#[test]
fn test_rollback_restores_everything() -> Result<()> {
    let host = Host::new()?;
    let first = host.constant(&host.game, "First", 1)?;
    let second = host.constant(&host.game, "Second", 2)?;
    let first_patch = host.constant(&host.detours, "First", 10)?;
    let second_patch = host.constant(&host.detours, "Second", 20)?;
    let broken_patch = host.constant(&host.detours, "Third", 30)?;

    let scope = RedirectScope::new("atomic")
        .redirect(&first_patch, from_source(&host.game, "First")?)
        .redirect(&second_patch, from_source(&host.game, "Second")?)
        .redirect(&broken_patch, from_source(&host.game, "Third")?);

    let redirector = host.redirector(RedirectConfig::strict());
    let report = redirector.perform_redirections(&scope);

    assert_eq!(report.rolled_back(), 2);
    assert_eq!(report.entries[0].outcome, RedirectOutcome::RolledBack);
    assert_eq!(report.entries[1].outcome, RedirectOutcome::RolledBack);
    assert!(report.entries[2].outcome.is_failure());
    assert!(redirector.registry().is_empty()?);
    assert_eq!(host.call(&first)?, Value::I32(1));
    assert_eq!(host.call(&second)?, Value::I32(2));
    Ok(())
}

/// Entries after the failure that triggered a rollback are still reported.
#[test]
fn test_rollback_reports_entries_after_the_failure() -> Result<()> {
    let host = Host::new()?;
    let first = host.constant(&host.game, "First", 1)?;
    let last = host.constant(&host.game, "Last", 3)?;
    let first_patch = host.constant(&host.detours, "First", 10)?;
    let broken_patch = host.constant(&host.detours, "Missing", 20)?;
    let last_patch = host.constant(&host.detours, "Last", 30)?;

    let scope = RedirectScope::new("atomic")
        .redirect(&first_patch, from_source(&host.game, "First")?)
        .redirect(&broken_patch, from_source(&host.game, "Missing")?)
        .redirect(&last_patch, from_source(&host.game, "Last")?);

    let redirector = host.redirector(RedirectConfig::strict());
    let report = redirector.perform_redirections(&scope);

    assert_eq!(report.entries.len(), scope.len());
    assert_eq!(report.entries[0].outcome, RedirectOutcome::RolledBack);
    assert!(report.entries[1].outcome.is_failure());
    assert_eq!(report.entries[2].outcome, RedirectOutcome::NotAttempted);
    assert_eq!(report.entries[2].source, Some(last.token));
    assert_eq!(report.not_attempted(), 1);
    assert_eq!(host.call(&first)?, Value::I32(1));
    assert_eq!(host.call(&last)?, Value::I32(3));
    Ok(())
}

#[test]
fn test_concurrent_passes_patch_once() -> Result<()> {
    let host = Host::new()?;
    let original = host.constant(&host.game, "Shared", 1)?;
    let replacement = host.constant(&host.detours, "Shared", 2)?;
    let scope = RedirectScope::new("shared").redirect(&replacement, from_source(&host.game, "Shared")?);
    let registry = Arc::new(RedirectionRegistry::new());

    let reports: Vec<RedirectReport> = std::thread::scope(|threads| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let redirector = Redirector::new(host.platform.clone(), host.platform.clone())
                    .with_registry(registry.clone());
                let scope = &scope;
                threads.spawn(move || redirector.perform_redirections(scope))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("redirection thread panicked"))
            .collect()
    });

    let applied: usize = reports.iter().map(RedirectReport::applied).sum();
    let duplicates = reports
        .iter()
        .flat_map(|report| &report.entries)
        .filter(|entry| entry.outcome == RedirectOutcome::PatchError(PatchErrorKind::AlreadyPatched))
        .count();
    assert_eq!(applied, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(registry.len()?, 1);
    assert_eq!(host.call(&original)?, Value::I32(2));
    Ok(())
}

/// Two hosts with identical catalogs share the process-wide registry. Their tokens are
/// equal, yet each host patches and restores only its own code.
#[test]
fn test_hosts_sharing_the_global_registry_stay_independent() -> Result<()> {
    let first = Host::new()?;
    let second = Host::new()?;
    let mut originals = Vec::new();
    let mut scopes = Vec::new();
    for host in [&first, &second] {
        originals.push(host.constant(&host.game, "Tick", 1)?);
        let replacement = host.constant(&host.detours, "Tick", 2)?;
        scopes.push(RedirectScope::new("tick").redirect(&replacement, from_source(&host.game, "Tick")?));
    }
    assert_eq!(originals[0].token, originals[1].token);

    let redirect_first = Redirector::new(first.platform.clone(), first.platform.clone());
    let redirect_second = Redirector::new(second.platform.clone(), second.platform.clone());
    assert!(Arc::ptr_eq(redirect_first.registry(), redirect_second.registry()));

    let applied = redirect_first.perform_redirections(&scopes[0]);
    assert!(applied.is_success(), "{applied}");
    let applied = redirect_second.perform_redirections(&scopes[1]);
    assert!(applied.is_success(), "{applied}");
    assert_eq!(first.call(&originals[0])?, Value::I32(2));
    assert_eq!(second.call(&originals[1])?, Value::I32(2));

    // Reverting the second host leaves the first one redirected and registered
    let first_writes = first.platform.write_count();
    assert_eq!(redirect_second.revert_redirections(&scopes[1]).reverted(), 1);
    assert_eq!(second.call(&originals[1])?, Value::I32(1));
    assert_eq!(first.call(&originals[0])?, Value::I32(2));
    assert_eq!(first.platform.write_count(), first_writes);
    assert!(RedirectionRegistry::global().contains(first.key(&originals[0]))?);

    assert_eq!(redirect_first.revert_redirections(&scopes[0]).reverted(), 1);
    assert_eq!(first.call(&originals[0])?, Value::I32(1));
    assert!(!RedirectionRegistry::global().contains(first.key(&originals[0]))?);
    Ok(())
}

/// A method reverted by one redirector can be redirected again by another.
#[test]
fn test_perform_after_revert_by_another_redirector() -> Result<()> {
    let host = Host::new()?;
    let original = host.constant(&host.game, "Tick", 1)?;
    let replacement = host.constant(&host.detours, "Tick", 2)?;
    let scope = RedirectScope::new("tick").redirect(&replacement, from_source(&host.game, "Tick")?);

    let registry = Arc::new(RedirectionRegistry::new());
    let applier = Redirector::new(host.platform.clone(), host.platform.clone())
        .with_registry(registry.clone());
    let reverter = Redirector::new(host.platform.clone(), host.platform.clone())
        .with_registry(registry.clone());

    assert!(applier.perform_redirections(&scope).is_success());
    assert_eq!(reverter.revert_redirections(&scope).reverted(), 1);
    assert_eq!(host.call(&original)?, Value::I32(1));

    let again = applier.perform_redirections(&scope);
    assert_eq!(
        again.entries[0].outcome,
        RedirectOutcome::Applied(PatchKind::EntryJump),
        "{again}"
    );
    assert_eq!(host.call(&original)?, Value::I32(2));
    assert_eq!(registry.len()?, 1);
    Ok(())
}

/// An entry where a jump would straddle a word without room to park it is refused.
#[test]
fn test_unaligned_entry_is_reported() -> Result<()> {
    let host = Host::new()?;
    let original = host
        .platform
        .method(&host.game, "Tick")
        .returns(TypeSignature::I4)
        .entry_offset(7)
        .body(|_, _| Ok(Value::I32(1)))
        .define()?;
    let replacement = host.constant(&host.detours, "Tick", 2)?;
    let scope = RedirectScope::new("tick").redirect(&replacement, from_source(&host.game, "Tick")?);

    let report = host.redirector(RedirectConfig::default()).perform_redirections(&scope);
    assert_eq!(
        report.entries[0].outcome,
        RedirectOutcome::PatchError(PatchErrorKind::UnalignedEntry)
    );
    assert_eq!(host.platform.write_count(), 0);
    assert_eq!(host.call(&original)?, Value::I32(1));
    Ok(())
}

#[test]
fn test_aarch64_host() -> Result<()> {
    let host = Host::with_architecture(Architecture::AArch64)?;
    let original = host.constant(&host.game, "Tick", 1)?;
    let replacement = host.constant(&host.detours, "Tick", 2)?;

    let scope = RedirectScope::new("a64").redirect(&replacement, from_source(&host.game, "Tick")?);
    let redirector = host.redirector(RedirectConfig::default());
    assert!(redirector.perform_redirections(&scope).is_success());
    assert_eq!(host.call(&original)?, Value::I32(2));

    redirector.revert_redirections(&scope);
    assert_eq!(host.call(&original)?, Value::I32(1));
    Ok(())
}

#[test]
fn test_every_store_stays_within_one_word() -> Result<()> {
    let host = Host::new()?;
    let mut scope = RedirectScope::new("words");
    for name in ["A", "B", "C", "D", "E"] {
        host.constant(&host.game, name, 0)?;
        let replacement = host.constant(&host.detours, name, 1)?;
        scope.push(&replacement, from_source(&host.game, name)?);
    }

    let redirector = host.redirector(RedirectConfig::default());
    redirector.perform_redirections(&scope);
    redirector.revert_redirections(&scope);

    let log = host.platform.write_log()?;
    assert!(!log.is_empty());
    assert!(log.iter().all(|step| step.is_single_word()));
    Ok(())
}
