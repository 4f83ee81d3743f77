//! Vendor module loading.
//!
//! The worker talks to the vendor through [`VendorModule`]. In production
//! that is a [`DylibModule`] opened from the configured path the first time
//! the Factory interface is used; tests inject a Rust implementation.

use std::ffi::{CStr, c_void};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once, PoisonError};

use libloading::Library;
use log::{debug, info};
use thiserror::Error;

use crate::cdm::ffi::{
    self, CREATE_CDM_INSTANCE, CreateCdmInstanceFn, ForeignCdm, GET_CDM_VERSION, GetCdmVersionFn,
    HostObject, INITIALIZE_CDM_MODULE, InitializeCdmModuleFn,
};
use crate::cdm::{ContentDecryptionModule, Host};

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("failed to load vendor module {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("vendor module does not export {symbol}: {source}")]
    MissingSymbol {
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },
}

/// Module-level entry points of a vendor CDM.
pub trait VendorModule: Send + Sync {
    /// `InitializeCdmModule_4`. Called once, before the first instance.
    fn initialize_module(&self);

    /// `CreateCdmInstance`. `None` when the vendor refuses.
    fn create_instance(
        &self,
        abi_version: i32,
        key_system: &str,
        host: Arc<dyn Host + Send + Sync>,
    ) -> Option<Box<dyn ContentDecryptionModule + Send + Sync>>;

    /// `GetCdmVersion`.
    fn version(&self) -> String;
}

/// A vendor shared library opened with `dlopen`.
pub struct DylibModule {
    initialize: InitializeCdmModuleFn,
    create: CreateCdmInstanceFn,
    get_version: GetCdmVersionFn,
    // Keeps the function pointers above valid.
    _library: Library,
}

impl DylibModule {
    pub fn load(path: &Path) -> Result<Self, VendorError> {
        debug!("loading vendor module {}", path.display());
        let library = unsafe { Library::new(path) }.map_err(|source| VendorError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        let initialize = unsafe { symbol::<InitializeCdmModuleFn>(&library, INITIALIZE_CDM_MODULE)? };
        let create = unsafe { symbol::<CreateCdmInstanceFn>(&library, CREATE_CDM_INSTANCE)? };
        let get_version = unsafe { symbol::<GetCdmVersionFn>(&library, GET_CDM_VERSION)? };

        Ok(Self {
            initialize,
            create,
            get_version,
            _library: library,
        })
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &'static [u8]) -> Result<T, VendorError> {
    let symbol = unsafe { library.get::<T>(name) }.map_err(|source| VendorError::MissingSymbol {
        symbol: symbol_name(name),
        source,
    })?;
    Ok(*symbol)
}

fn symbol_name(name: &'static [u8]) -> &'static str {
    let name = name.strip_suffix(b"\0").unwrap_or(name);
    std::str::from_utf8(name).unwrap_or("<non-utf8 symbol>")
}

impl VendorModule for DylibModule {
    fn initialize_module(&self) {
        unsafe { (self.initialize)() }
    }

    fn create_instance(
        &self,
        abi_version: i32,
        key_system: &str,
        host: Arc<dyn Host + Send + Sync>,
    ) -> Option<Box<dyn ContentDecryptionModule + Send + Sync>> {
        let host = HostObject::into_raw(host);
        let raw = unsafe {
            (self.create)(
                abi_version,
                key_system.as_ptr().cast(),
                ffi::len_u32(key_system.len()),
                ffi::get_cdm_host,
                host.as_ptr().cast::<c_void>(),
            )
        };
        match std::ptr::NonNull::new(raw.cast::<ffi::CppCdm>()) {
            Some(raw) => Some(Box::new(unsafe { ForeignCdm::from_raw(raw, host) })),
            None => {
                unsafe { HostObject::free(host) };
                None
            }
        }
    }

    fn version(&self) -> String {
        let raw = unsafe { (self.get_version)() };
        if raw.is_null() {
            return String::from("unknown");
        }
        unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
    }
}

enum Source {
    Path(PathBuf),
    Preloaded,
}

/// Process-lifetime handle on the vendor module: loaded on first use,
/// module-initialized exactly once, never unloaded.
pub struct VendorHandle {
    source: Source,
    module: Mutex<Option<Arc<dyn VendorModule>>>,
    initialized: Once,
}

impl VendorHandle {
    /// Opens the shared library at `path` on first use.
    pub fn lazy(path: PathBuf) -> Self {
        Self {
            source: Source::Path(path),
            module: Mutex::new(None),
            initialized: Once::new(),
        }
    }

    pub fn preloaded(module: Arc<dyn VendorModule>) -> Self {
        Self {
            source: Source::Preloaded,
            module: Mutex::new(Some(module)),
            initialized: Once::new(),
        }
    }

    /// The module, loaded and initialized.
    pub fn get(&self) -> Result<Arc<dyn VendorModule>, VendorError> {
        let module = {
            let mut slot = self.module.lock().unwrap_or_else(PoisonError::into_inner);
            match (&*slot, &self.source) {
                (Some(module), _) => Arc::clone(module),
                (None, Source::Path(path)) => {
                    let module: Arc<dyn VendorModule> = Arc::new(DylibModule::load(path)?);
                    *slot = Some(Arc::clone(&module));
                    module
                }
                (None, Source::Preloaded) => crate::fatal("preloaded vendor module missing"),
            }
        };

        self.initialized.call_once(|| {
            info!("vendor module version {}", module.version());
            module.initialize_module();
        });
        Ok(module)
    }
}
