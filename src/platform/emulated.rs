//! Emulated host runtime.
//!
//! [`EmulatedPlatform`] simulates the parts of a managed runtime the redirection core
//! interacts with: a type and method catalog, lazily compiled method code in an
//! executable region, dispatch slots for virtual methods, page protections, and an
//! executor that runs methods the way the host's call dispatch would - by jumping to the
//! entry point (or through the dispatch slot) and following whatever instructions it
//! finds there.
//!
//! Method bodies are Rust closures. Compiling a method reserves `code_size` bytes in the
//! code region, fills them with a prologue and padding, and binds the closure to that
//! address. When [`invoke`](EmulatedPlatform::invoke) reaches an address it first checks
//! for a jump stub (an installed redirection) and follows it; otherwise it runs the body
//! compiled at that address.
//!
//! # Calling Convention
//!
//! Arguments are passed as a flat slice. Instance methods receive their receiver as the
//! first element, which is why an instance method can be redirected to a static method
//! taking the receiver explicitly without any argument shuffling.
//!
//! # Examples
//!
//! ```rust
//! use redirection::platform::{EmulatedPlatform, Value};
//! use redirection::metadata::signature::TypeSignature;
//!
//! let host = EmulatedPlatform::new()?;
//! let math = host.define_type("Game", "Math");
//! let double = host
//!     .method(&math, "Double")
//!     .param(TypeSignature::I4)
//!     .returns(TypeSignature::I4)
//!     .body(|_, args| Ok(Value::I32(args[0].as_i32().unwrap_or_default() * 2)))
//!     .define()?;
//!
//! assert_eq!(host.invoke(double.token, &[Value::I32(21)])?, Value::I32(42));
//! # Ok::<(), redirection::Error>(())
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use dashmap::DashMap;
use memmap2::MmapMut;

use crate::{
    metadata::{
        method::{MethodCatalog, MethodDescriptor, MethodDescriptorRc, MethodTable, TypeRef},
        signature::{MethodSignature, TypeSignature},
        token::Token,
    },
    patch::{Architecture, WritePlan, WriteStep},
    platform::{EntryPoint, HostId, MemoryProtection, Platform},
    Error, Result,
};

/// Base address of the emulated code region.
pub const CODE_BASE: u64 = 0x0040_0000;

/// Base address of the emulated dispatch table region.
pub const SLOT_BASE: u64 = 0x0800_0000;

/// Size of each emulated region.
const REGION_SIZE: usize = 0x10_0000;

/// Page granularity of protection changes.
const PAGE_SIZE: u64 = 0x1000;

/// Alignment of compiled method entries.
const CODE_ALIGN: u64 = 16;

/// Code bytes reserved per method unless configured otherwise.
pub const DEFAULT_CODE_SIZE: usize = 32;

/// Maximum number of chained jumps followed by one call.
const MAX_HOPS: usize = 64;

/// A value passed to or returned from an emulated method.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value
    Void,
    /// Boolean
    Bool(bool),
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 64-bit float
    F64(f64),
    /// Immutable string
    Str(Arc<str>),
    /// Handle of an object instance
    Object(u64),
}

impl Value {
    /// Returns the integer if this is an [`I32`](Value::I32).
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the handle if this is an [`Object`](Value::Object).
    #[must_use]
    pub fn as_object(&self) -> Option<u64> {
        match self {
            Value::Object(handle) => Some(*handle),
            _ => None,
        }
    }
}

/// Body of an emulated method.
///
/// Receives the platform, so bodies can call other methods, and the arguments (receiver
/// first for instance methods).
pub type MethodBody = Arc<dyn Fn(&EmulatedPlatform, &[Value]) -> Result<Value> + Send + Sync>;

struct MethodState {
    body: MethodBody,
    code_size: usize,
    entry_offset: u64,
    is_virtual: bool,
    compile_fails: bool,
    entry: Option<EntryPoint>,
}

/// A contiguous, anonymously mapped region with page protections.
struct CodeRegion {
    base: u64,
    memory: MmapMut,
    used: u64,
    pages: Vec<MemoryProtection>,
}

impl CodeRegion {
    fn new(base: u64, protection: MemoryProtection) -> Result<Self> {
        let memory = MmapMut::map_anon(REGION_SIZE)?;
        let pages = vec![protection; REGION_SIZE / PAGE_SIZE as usize];
        Ok(CodeRegion {
            base,
            memory,
            used: 0,
            pages,
        })
    }

    fn end(&self) -> u64 {
        self.base + self.memory.len() as u64
    }

    fn contains(&self, address: u64, len: usize) -> bool {
        address >= self.base
            && address
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end())
    }

    fn offset(&self, address: u64) -> usize {
        (address - self.base) as usize
    }

    fn alloc(&mut self, size: usize, align: u64) -> Result<u64> {
        let start = (self.used + align - 1) & !(align - 1);
        let end = start + size as u64;
        if end > self.memory.len() as u64 {
            return Err(Error::Error(format!(
                "emulated region at 0x{:x} is exhausted",
                self.base
            )));
        }
        self.used = end;
        Ok(self.base + start)
    }

    fn read(&self, address: u64, len: usize) -> Vec<u8> {
        let start = self.offset(address);
        self.memory[start..start + len].to_vec()
    }

    fn store(&mut self, address: u64, bytes: &[u8]) {
        let start = self.offset(address);
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn page_range(&self, address: u64, len: usize) -> std::ops::Range<usize> {
        let first = self.offset(address) / PAGE_SIZE as usize;
        let last = (self.offset(address) + len.max(1) - 1) / PAGE_SIZE as usize;
        first..last + 1
    }

    fn protection_at(&self, address: u64) -> MemoryProtection {
        self.pages[self.offset(address) / PAGE_SIZE as usize]
    }
}

/// Simulated host runtime; see the [module documentation](self).
pub struct EmulatedPlatform {
    id: HostId,
    arch: Architecture,
    catalog: MethodTable,
    methods: DashMap<Token, MethodState>,
    bodies: DashMap<u64, Token>,
    code: RwLock<CodeRegion>,
    slots: RwLock<CodeRegion>,
    denied: RwLock<Vec<(u64, u64)>>,
    next_type: AtomicU32,
    compiles: AtomicU64,
    protection_toggles: AtomicU64,
    write_log: Mutex<Vec<WriteStep>>,
}

impl EmulatedPlatform {
    /// Creates an empty x86-64 host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OsError`] if the backing memory cannot be mapped.
    pub fn new() -> Result<Self> {
        Self::with_architecture(Architecture::X86_64)
    }

    /// Creates an empty host for the given architecture.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OsError`] if the backing memory cannot be mapped.
    pub fn with_architecture(arch: Architecture) -> Result<Self> {
        Ok(EmulatedPlatform {
            id: HostId::next(),
            arch,
            catalog: MethodTable::new(),
            methods: DashMap::new(),
            bodies: DashMap::new(),
            code: RwLock::new(CodeRegion::new(CODE_BASE, MemoryProtection::READ_EXECUTE)?),
            slots: RwLock::new(CodeRegion::new(SLOT_BASE, MemoryProtection::READ)?),
            denied: RwLock::new(Vec::new()),
            next_type: AtomicU32::new(0),
            compiles: AtomicU64::new(0),
            protection_toggles: AtomicU64::new(0),
            write_log: Mutex::new(Vec::new()),
        })
    }

    /// Defines a new type.
    pub fn define_type(&self, namespace: &str, name: &str) -> TypeRef {
        let row = self.next_type.fetch_add(1, Ordering::Relaxed) + 1;
        TypeRef::new(Token::type_def(row), namespace, name)
    }

    /// Starts defining a method on `declaring_type`.
    pub fn method<'a>(&'a self, declaring_type: &TypeRef, name: &str) -> MethodBuilder<'a> {
        MethodBuilder::new(self, declaring_type.clone(), name)
    }

    /// Looks up a method descriptor by token.
    #[must_use]
    pub fn descriptor(&self, method: Token) -> Option<MethodDescriptorRc> {
        self.catalog.get(method)
    }

    /// Returns `true` if the method's code has been materialized.
    #[must_use]
    pub fn is_compiled(&self, method: Token) -> bool {
        self.methods
            .get(&method)
            .is_some_and(|state| state.entry.is_some())
    }

    /// Number of methods compiled so far.
    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    /// Number of stores performed through [`Platform::write_code`].
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.write_log.lock().map(|log| log.len()).unwrap_or_default()
    }

    /// Number of page protection changes performed while writing.
    #[must_use]
    pub fn protection_toggles(&self) -> u64 {
        self.protection_toggles.load(Ordering::Relaxed)
    }

    /// Every store performed through [`Platform::write_code`], in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the log lock is poisoned.
    pub fn write_log(&self) -> Result<Vec<WriteStep>> {
        Ok(lock!(self.write_log)?.clone())
    }

    /// Current protection of the page containing `address`.
    #[must_use]
    pub fn protection_at(&self, address: u64) -> Option<MemoryProtection> {
        for region in [&self.code, &self.slots] {
            let region = region.read().ok()?;
            if region.contains(address, 1) {
                return Some(region.protection_at(address));
            }
        }
        None
    }

    /// Makes `len` bytes at `address` impossible to make writable, as a locked-down host
    /// page would be.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn deny_writes(&self, address: u64, len: usize) -> Result<()> {
        write_lock!(self.denied)?.push((address, address + len as u64));
        Ok(())
    }

    /// Compiles `method` and denies writes to its entry and dispatch slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the method cannot be compiled.
    pub fn deny_method_writes(&self, method: Token) -> Result<()> {
        let entry = self.compile(method)?;
        self.deny_writes(entry.address, entry.capacity)?;
        if let Some(slot) = entry.dispatch_slot {
            self.deny_writes(slot, 8)?;
        }
        Ok(())
    }

    /// Calls `method` the way the host's dispatch would.
    ///
    /// Compiles the method on first use, enters through its dispatch slot if it has one
    /// and follows installed jumps until a method body is reached. For instance methods
    /// `args[0]` is the receiver.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails, control reaches an address without code,
    /// too many jumps are chained, or the body itself fails.
    pub fn invoke(&self, method: Token, args: &[Value]) -> Result<Value> {
        let entry = self.compile(method)?;
        let start = match entry.dispatch_slot {
            Some(slot) => {
                let raw = read_lock!(self.slots)?.read(slot, 8);
                let mut pointer = [0u8; 8];
                pointer.copy_from_slice(&raw);
                u64::from_le_bytes(pointer)
            }
            None => entry.address,
        };
        self.execute_at(start, args)
    }

    fn execute_at(&self, start: u64, args: &[Value]) -> Result<Value> {
        let mut address = start;
        for _ in 0..MAX_HOPS {
            let bytes = {
                let code = read_lock!(self.code)?;
                if !code.contains(address, 1) {
                    return Err(Error::InvalidAddress {
                        address,
                        reason: "control transferred outside of code".to_string(),
                    });
                }
                let available = (code.end() - address) as usize;
                code.read(address, available.min(self.arch.max_jump_len()))
            };

            // A spinning entry would hang the caller forever
            if bytes.starts_with(self.arch.spin()) {
                return Err(Error::Error(format!(
                    "entry 0x{address:x} is parked on a spin instruction"
                )));
            }
            if let Some(target) = self.arch.decode_jump(address, &bytes) {
                address = target;
                continue;
            }

            let token = self
                .bodies
                .get(&address)
                .map(|token| *token)
                .ok_or_else(|| Error::InvalidAddress {
                    address,
                    reason: "no method body at address".to_string(),
                })?;
            let body = self
                .methods
                .get(&token)
                .map(|state| state.body.clone())
                .ok_or(Error::NotYetCompiled(token))?;
            return body(self, args);
        }

        Err(Error::RecursionLimit(MAX_HOPS))
    }

    fn compile(&self, method: Token) -> Result<EntryPoint> {
        let mut state = self
            .methods
            .get_mut(&method)
            .ok_or(Error::NotYetCompiled(method))?;
        if let Some(entry) = state.entry {
            return Ok(entry);
        }
        if state.compile_fails {
            return Err(Error::NotYetCompiled(method));
        }

        let address = {
            let mut code = write_lock!(self.code)?;
            let address = code.alloc(state.code_size + state.entry_offset as usize, CODE_ALIGN)?
                + state.entry_offset;
            code.store(address, &self.emit(state.code_size));
            address
        };

        let mut entry = EntryPoint::new(address, state.code_size);
        if state.is_virtual {
            let mut slots = write_lock!(self.slots)?;
            let slot = slots.alloc(8, 8)?;
            slots.store(slot, &address.to_le_bytes());
            entry = entry.with_slot(slot);
        }

        self.bodies.insert(address, method);
        state.entry = Some(entry);
        self.compiles.fetch_add(1, Ordering::Relaxed);
        log::trace!("compiled {method} at 0x{address:x} ({} bytes)", state.code_size);
        Ok(entry)
    }

    /// Produces the machine code image of a freshly compiled method.
    fn emit(&self, size: usize) -> Vec<u8> {
        let mut image = Vec::with_capacity(size);
        image.extend_from_slice(self.arch.prologue());
        let padding = self.arch.padding();
        while image.len() < size {
            image.extend_from_slice(padding);
        }
        image.truncate(size);
        image
    }

    fn is_denied(&self, address: u64, len: usize) -> Result<bool> {
        let end = address + len as u64;
        Ok(read_lock!(self.denied)?
            .iter()
            .any(|&(start, stop)| address < stop && start < end))
    }

    fn region_for(&self, address: u64, len: usize) -> Result<&RwLock<CodeRegion>> {
        for region in [&self.code, &self.slots] {
            if read_lock!(region)?.contains(address, len) {
                return Ok(region);
            }
        }
        Err(Error::InvalidAddress {
            address,
            reason: format!("{len} bytes are not mapped"),
        })
    }
}

impl Platform for EmulatedPlatform {
    fn host_id(&self) -> HostId {
        self.id
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn force_compile(&self, method: &MethodDescriptor) -> Result<EntryPoint> {
        self.compile(method.token)
    }

    fn read_code(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let region = self.region_for(address, len)?;
        Ok(read_lock!(region)?.read(address, len))
    }

    fn check_writable(&self, address: u64, len: usize) -> Result<()> {
        self.region_for(address, len)?;
        if self.is_denied(address, len)? {
            return Err(Error::WritePermissionDenied {
                address,
                reason: "page protection cannot be changed".to_string(),
            });
        }
        Ok(())
    }

    fn write_code(&self, plan: &WritePlan) -> Result<()> {
        if let Some(step) = plan.steps.iter().find(|step| !step.is_single_word()) {
            return Err(malformed_error!(
                "store at 0x{:x} spans more than one word",
                step.address
            ));
        }
        self.check_writable(plan.address, plan.len())?;

        let region = self.region_for(plan.address, plan.len())?;
        let mut region = write_lock!(region)?;
        let mut log = lock!(self.write_log)?;

        let pages = region.page_range(plan.address, plan.len());
        let saved: Vec<MemoryProtection> = region.pages[pages.clone()].to_vec();
        for page in pages.clone() {
            region.pages[page] |= MemoryProtection::WRITE;
        }
        self.protection_toggles
            .fetch_add(pages.len() as u64, Ordering::Relaxed);

        for step in &plan.steps {
            log::trace!("store {} byte(s) at 0x{:x}", step.bytes.len(), step.address);
            region.store(step.address, &step.bytes);
            log.push(step.clone());
        }

        for (page, protection) in pages.zip(saved) {
            region.pages[page] = protection;
        }
        Ok(())
    }
}

impl MethodCatalog for EmulatedPlatform {
    fn methods_of(&self, declaring_type: &TypeRef) -> Vec<MethodDescriptorRc> {
        self.catalog.methods_of(declaring_type)
    }

    fn entry_point(&self, method: Token) -> Option<EntryPoint> {
        self.methods.get(&method).and_then(|state| state.entry)
    }
}

impl fmt::Debug for EmulatedPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedPlatform")
            .field("id", &self.id)
            .field("arch", &self.arch)
            .field("method_count", &self.methods.len())
            .field("compiled", &self.compile_count())
            .finish()
    }
}

/// Builder for methods of an [`EmulatedPlatform`].
///
/// Methods are static, return `void`, take no parameters, reserve
/// [`DEFAULT_CODE_SIZE`] bytes and compile lazily unless configured otherwise.
pub struct MethodBuilder<'a> {
    platform: &'a EmulatedPlatform,
    declaring_type: TypeRef,
    name: String,
    signature: MethodSignature,
    code_size: usize,
    entry_offset: u64,
    is_virtual: bool,
    eager: bool,
    compile_fails: bool,
    body: Option<MethodBody>,
}

impl<'a> MethodBuilder<'a> {
    fn new(platform: &'a EmulatedPlatform, declaring_type: TypeRef, name: &str) -> Self {
        MethodBuilder {
            platform,
            declaring_type,
            name: name.to_string(),
            signature: MethodSignature::static_method(TypeSignature::Void, Vec::new()),
            code_size: DEFAULT_CODE_SIZE,
            entry_offset: 0,
            is_virtual: false,
            eager: false,
            compile_fails: false,
            body: None,
        }
    }

    /// Makes the method an instance method.
    #[must_use]
    pub fn instance(mut self) -> Self {
        self.signature.has_this = true;
        self
    }

    /// Appends a parameter.
    #[must_use]
    pub fn param(mut self, param: TypeSignature) -> Self {
        self.signature.params.push(param);
        self
    }

    /// Sets the return type.
    #[must_use]
    pub fn returns(mut self, return_type: TypeSignature) -> Self {
        self.signature.return_type = return_type;
        self
    }

    /// Sets the number of code bytes reserved for the method.
    #[must_use]
    pub fn code_size(mut self, size: usize) -> Self {
        self.code_size = size.max(1);
        self
    }

    /// Places the entry `offset` bytes past the usual 16-byte alignment, the way
    /// unpadded code of a native host can start at any byte.
    #[must_use]
    pub fn entry_offset(mut self, offset: u64) -> Self {
        self.entry_offset = offset % CODE_ALIGN;
        self
    }

    /// Dispatches calls through a slot in the dispatch table.
    #[must_use]
    pub fn virtual_slot(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    /// Compiles the method as soon as it is defined.
    #[must_use]
    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    /// Makes every compilation attempt fail.
    #[must_use]
    pub fn compile_fails(mut self) -> Self {
        self.compile_fails = true;
        self
    }

    /// Sets the method body.
    #[must_use]
    pub fn body<F>(mut self, body: F) -> Self
    where
        F: Fn(&EmulatedPlatform, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.body = Some(Arc::new(body));
        self
    }

    /// Registers the method with the platform.
    ///
    /// # Errors
    ///
    /// Returns an error if the method is eager and compilation fails.
    pub fn define(self) -> Result<MethodDescriptorRc> {
        let descriptor = self
            .platform
            .catalog
            .define(&self.declaring_type, &self.name, self.signature);
        let body = self
            .body
            .unwrap_or_else(|| Arc::new(|_: &EmulatedPlatform, _: &[Value]| Ok(Value::Void)));

        self.platform.methods.insert(
            descriptor.token,
            MethodState {
                body,
                code_size: self.code_size,
                entry_offset: self.entry_offset,
                is_virtual: self.is_virtual,
                compile_fails: self.compile_fails,
                entry: None,
            },
        );

        if self.eager {
            self.platform.compile(descriptor.token)?;
        }
        Ok(descriptor)
    }
}
