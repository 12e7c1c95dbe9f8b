// src/ffi.rs
#![cfg(feature = "ffi")]

//! C ABI поверх глобального runtime.
//!
//! Модель:
//! - nvthreads_init(path) открывает глобальный движок (конфиг из NVT_* env, ловушки
//!   всегда аппаратные — записи по выданным указателям должны отслеживаться);
//! - nvmalloc/nvrecover/nvcheckpoint/isCrashed — тонкие обёртки над Engine;
//! - int-возвраты: 0=OK, -1=ERR; ошибки пишутся в лог (error!).
//!
//! Компиляция:
//!   cargo build --release --features ffi

use std::ffi::CStr;
use std::ptr;

use libc::{c_char, c_int, c_void, size_t};
use log::error;

use crate::config::EngineConfig;
use crate::runtime;

unsafe fn cstr<'a>(c: *const c_char) -> Option<&'a str> {
    if c.is_null() {
        return None;
    }
    CStr::from_ptr(c).to_str().ok()
}

/// Открыть движок в каталоге `path`.
#[no_mangle]
pub unsafe extern "C" fn nvthreads_init(path: *const c_char) -> c_int {
    let Some(p) = cstr(path) else {
        error!("nvthreads_init: null or non-UTF-8 path");
        return -1;
    };
    match runtime::init_global(std::path::Path::new(p), EngineConfig::from_env()) {
        Ok(_) => 0,
        Err(e) => {
            error!("nvthreads_init({}): {:#}", p, e);
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn nvthreads_shutdown() -> c_int {
    match runtime::shutdown_global() {
        Ok(()) => 0,
        Err(e) => {
            error!("nvthreads_shutdown: {:#}", e);
            -1
        }
    }
}

/// Именованная аллокация; NULL при ошибке или до инициализации.
#[no_mangle]
pub unsafe extern "C" fn nvmalloc(size: size_t, name: *const c_char) -> *mut c_void {
    let Some(n) = cstr(name) else {
        return ptr::null_mut();
    };
    runtime::nvmalloc(size as usize, n) as *mut c_void
}

/// Скопировать до `size` байт аллокации `name` в `dest`; вернуть её адрес (NULL — нет такой).
#[no_mangle]
pub unsafe extern "C" fn nvrecover(dest: *mut c_void, size: size_t, name: *const c_char) -> *mut c_void {
    let (Some(e), Some(n)) = (runtime::global(), cstr(name)) else {
        return ptr::null_mut();
    };
    let buf: &mut [u8] = if dest.is_null() || size == 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(dest as *mut u8, size as usize)
    };
    e.nvrecover(buf, n)
        .map_or(ptr::null_mut(), |addr| addr as *mut c_void)
}

#[no_mangle]
pub extern "C" fn nvcheckpoint() -> c_int {
    let Some(e) = runtime::global() else {
        return 0;
    };
    match e.nvcheckpoint() {
        Ok(_) => 0,
        Err(err) => {
            error!("nvcheckpoint: {:#}", err);
            -1
        }
    }
}

#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn isCrashed() -> c_int {
    runtime::global().map_or(0, |e| e.is_crashed() as c_int)
}
