use std::{
    ffi::{c_void, CStr},
    fmt, mem,
};

use serde::{Deserialize, Serialize};

/// What a return address turned out to be.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Function name, demangled where possible
    pub name: String,
    /// How far into the function the address is
    pub displacement: usize,
    /// Source file, or the containing object if that is all we know
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolveErrorKind {
    /// The address is not inside any loaded object
    NotMapped,
    /// The object is known, but nothing covers the address
    NoSymbol,
}

/// A lookup that came back empty. Never fatal; the frame is reported as
/// unresolved and the dump moves on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveError {
    pub kind: ResolveErrorKind,
    /// The lookup that failed, e.g. `dladdr`
    pub resolver: String,
    /// What the lookup said about it
    pub reason: String,
    /// The platform error code, `0` if the platform didn't give one
    pub code: i32,
}

impl ResolveError {
    pub fn new(kind: ResolveErrorKind, resolver: &str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            resolver: resolver.to_owned(),
            reason: reason.into(),
            code: 0,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn code(&self) -> i32 {
        self.code
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}() failed: {}. Error code: {}",
            self.resolver, self.reason, self.code
        )
    }
}

impl std::error::Error for ResolveError {}

/// Turns raw code addresses into names. Only used while dumping leaks, so
/// it is free to allocate.
pub trait SymbolResolver {
    fn resolve(&self, address: usize) -> Result<Symbol, ResolveError>;
}

impl<R> SymbolResolver for &R
where
    R: SymbolResolver + ?Sized,
{
    fn resolve(&self, address: usize) -> Result<Symbol, ResolveError> {
        (**self).resolve(address)
    }
}

/// Debug-info lookups through [`backtrace::resolve()`]. Gives file and line
/// whenever the binary carries DWARF (or PDB) information.
///
/// Addresses are treated as return addresses: the lookup is done on the
/// byte before, so a call at the very end of a function still resolves to
/// that function.
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceResolver;

impl SymbolResolver for BacktraceResolver {
    fn resolve(&self, address: usize) -> Result<Symbol, ResolveError> {
        let mut found = None;
        backtrace::resolve(address as *mut c_void, |symbol| {
            // Inlined frames come innermost first; keep the first named one
            if found.is_some() {
                return;
            }
            let Some(name) = symbol.name() else {
                return;
            };
            found = Some(Symbol {
                name: format!("{name:#}"),
                displacement: symbol
                    .addr()
                    .map_or(0, |start| address.wrapping_sub(start as usize)),
                file: symbol.filename().map(|path| path.display().to_string()),
                line: symbol.lineno(),
            });
        });
        found.ok_or_else(|| {
            ResolveError::new(
                ResolveErrorKind::NoSymbol,
                "backtrace::resolve",
                "no symbol or debug information covers this address",
            )
        })
    }
}

/// `dladdr()` lookups. Only exported (dynamic) symbols have names, and there
/// is no line information; `file` is the shared object or executable.
#[derive(Clone, Copy, Debug, Default)]
pub struct DladdrResolver;

/// # Safety
/// `ptr` must be null or a NUL-terminated string that outlives this call
unsafe fn owned_cstr(ptr: *const libc::c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}

/// The pending `dlerror()` message, if the loader left one
fn take_dlerror() -> Option<String> {
    // SAFETY: the message belongs to the loader and stays valid until the
    // next `dl*()` call on this thread, we copy it out before that
    unsafe { owned_cstr(libc::dlerror()) }
}

impl SymbolResolver for DladdrResolver {
    fn resolve(&self, address: usize) -> Result<Symbol, ResolveError> {
        // stale messages from earlier calls would be blamed on this one
        let _ = take_dlerror();
        // SAFETY: `Dl_info` is plain pointers and is fully written on success
        let mut info: libc::Dl_info = unsafe { mem::zeroed() };
        // SAFETY: `dladdr()` only inspects the loader's tables; any address
        // value is acceptable
        let rc = unsafe { libc::dladdr(address as *const c_void, &mut info) };
        if rc == 0 {
            let reason = take_dlerror()
                .unwrap_or_else(|| "address is not in any loaded object".to_owned());
            return Err(ResolveError::new(ResolveErrorKind::NotMapped, "dladdr", reason));
        }
        // SAFETY: the strings belong to the loader and stay alive while the
        // object is loaded, which it is since our own code lives in it
        let file = unsafe { owned_cstr(info.dli_fname) };
        let Some(name) = (unsafe { owned_cstr(info.dli_sname) }) else {
            let reason = take_dlerror().unwrap_or_else(|| match &file {
                Some(file) => format!("no exported symbol in {file}"),
                None => "no exported symbol covers this address".to_owned(),
            });
            return Err(ResolveError::new(ResolveErrorKind::NoSymbol, "dladdr", reason));
        };
        Ok(Symbol {
            name,
            displacement: address.wrapping_sub(info.dli_saddr as usize),
            file,
            line: None,
        })
    }
}

/// Ask `primary` first and `fallback` only if that fails. When both fail,
/// the primary's error is kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct FallbackResolver<P, F> {
    pub primary: P,
    pub fallback: F,
}

impl<P, F> SymbolResolver for FallbackResolver<P, F>
where
    P: SymbolResolver,
    F: SymbolResolver,
{
    fn resolve(&self, address: usize) -> Result<Symbol, ResolveError> {
        self.primary
            .resolve(address)
            .or_else(|e| self.fallback.resolve(address).map_err(|_| e))
    }
}

/// Debug info first, exported symbols for stripped binaries.
pub type DefaultResolver = FallbackResolver<BacktraceResolver, DladdrResolver>;
