//! CDM plugin entry points.
//!
//! Exposes the module-level functions a host expects from a CDM shared
//! library. Each instance is a [`HostShim`] talking to its own worker
//! process; the vendor module is never loaded into the host.

#![allow(non_snake_case)]

use std::ffi::{CString, c_char, c_int, c_void};
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::slice;
use std::sync::{Mutex, Once, PoisonError};

use fcdm::Config;
use fcdm::broker;
use fcdm::cdm::Host;
use fcdm::cdm::ffi::{CdmObject, CppHost, ForeignHost, GetCdmHostFn};
use fcdm::error::{BootstrapError, BootstrapResult};
use fcdm::protocol::HOST_INTERFACE_VERSION;
use fcdm::shim::HostShim;
use log::{error, info};

static LOGGING: Once = Once::new();

fn init_logging() {
    LOGGING.call_once(|| {
        // The host may already have installed a logger.
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .try_init();
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn InitializeCdmModule_4() {
    init_logging();
    info!("fcdm plugin {} initialized", env!("CARGO_PKG_VERSION"));
}

#[unsafe(no_mangle)]
pub extern "C" fn DeinitializeCdmModule() {
    info!("fcdm plugin deinitialized");
}

/// Returns a `cdm::ContentDecryptionModule_10*`, or null on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn CreateCdmInstance(
    cdm_interface_version: c_int,
    key_system: *const c_char,
    key_system_size: u32,
    get_cdm_host_func: Option<GetCdmHostFn>,
    user_data: *mut c_void,
) -> *mut c_void {
    init_logging();
    let key_system = unsafe { abi_str(key_system, key_system_size) };
    let created = unsafe {
        create_instance(cdm_interface_version, &key_system, get_cdm_host_func, user_data)
    };
    match created {
        Ok(cdm) => cdm.cast::<c_void>().as_ptr(),
        Err(e) => {
            error!("CreateCdmInstance({cdm_interface_version}, {key_system:?}) failed: {e}");
            ptr::null_mut()
        }
    }
}

unsafe fn create_instance(
    cdm_interface_version: c_int,
    key_system: &str,
    get_cdm_host_func: Option<GetCdmHostFn>,
    user_data: *mut c_void,
) -> BootstrapResult<NonNull<fcdm::cdm::ffi::CppCdm>> {
    let get_host = get_cdm_host_func.ok_or(BootstrapError::NoHost(HOST_INTERFACE_VERSION))?;
    let raw = unsafe { get_host(HOST_INTERFACE_VERSION, user_data) };
    let raw = NonNull::new(raw.cast::<CppHost>())
        .ok_or(BootstrapError::NoHost(HOST_INTERFACE_VERSION))?;
    let host: Rc<dyn Host> = Rc::new(unsafe { ForeignHost::from_raw(raw) });

    let config = Config::load()?;
    let shim = HostShim::create(&config, cdm_interface_version, key_system, host)?;
    Ok(CdmObject::into_raw(Box::new(shim)))
}

static VERSION: Mutex<Option<CString>> = Mutex::new(None);

/// Vendor version as reported by a throwaway worker, or null when it could
/// not be queried. Cached after the first success.
#[unsafe(no_mangle)]
pub extern "C" fn GetCdmVersion() -> *const c_char {
    init_logging();
    let mut cached = VERSION.lock().unwrap_or_else(PoisonError::into_inner);
    if cached.is_none() {
        match query_version() {
            Ok(version) => *cached = Some(version),
            Err(e) => {
                error!("GetCdmVersion failed: {e}");
                return ptr::null();
            }
        }
    }
    // Never replaced once set, so the pointer stays valid.
    cached.as_ref().map_or(ptr::null(), |version| version.as_ptr())
}

fn query_version() -> BootstrapResult<CString> {
    let config = Config::load()?;
    let version = broker::query_version(&config)?;
    // Interior NULs cannot cross the ABI; keep everything before the first.
    let bytes: Vec<u8> = version.into_bytes().into_iter().take_while(|b| *b != 0).collect();
    Ok(CString::new(bytes).unwrap_or_default())
}

unsafe fn abi_str(data: *const c_char, len: u32) -> String {
    if data.is_null() || len == 0 {
        return String::new();
    }
    let bytes = unsafe { slice::from_raw_parts(data.cast::<u8>(), len as usize) };
    String::from_utf8_lossy(bytes).into_owned()
}
