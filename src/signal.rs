//! Доставка аппаратных ловушек: SIGSEGV (sigaction + SA_SIGINFO) -> TrapTarget::on_trap.
//!
//! Правила:
//! - Обработчик один на процесс; владеть им может один движок одновременно.
//! - Предыдущая диспозиция сохраняется при установке и возвращается при снятии.
//! - Чужая ошибка (FaultAction::Forward): восстанавливаем предыдущую диспозицию и выходим;
//!   инструкция перезапускается уже под ней (в т.ч. обработчик переполнения стека std).
//! - Цель хранится как Weak: обработчик не продлевает жизнь движка.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, Weak};

use anyhow::{anyhow, Result};
use log::debug;

use crate::trap::{FaultAction, TrapTarget};

static INSTALLED: AtomicBool = AtomicBool::new(false);
static TARGET: AtomicPtr<Weak<dyn TrapTarget>> = AtomicPtr::new(std::ptr::null_mut());
static IN_HANDLER: AtomicUsize = AtomicUsize::new(0);

#[cfg(unix)]
struct SavedAction(libc::sigaction);

// sigaction — простая C-структура без владения ресурсами.
#[cfg(unix)]
unsafe impl Send for SavedAction {}

#[cfg(unix)]
static PREVIOUS: Mutex<Option<SavedAction>> = Mutex::new(None);

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// Установить обработчик SIGSEGV, направляющий ловушки в `target`.
#[cfg(unix)]
pub fn install(target: Weak<dyn TrapTarget>) -> Result<()> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(anyhow!("SIGSEGV trap handler is already owned by another engine"));
    }

    let boxed = Box::into_raw(Box::new(target));
    TARGET.store(boxed, Ordering::Release);

    // SAFETY: sigaction с корректно инициализированными структурами.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigsegv as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        let mut prev: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &action, &mut prev) != 0 {
            let err = std::io::Error::last_os_error();
            let old = TARGET.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !old.is_null() {
                drop(Box::from_raw(old));
            }
            INSTALLED.store(false, Ordering::Release);
            return Err(anyhow!("sigaction(SIGSEGV) failed: {}", err));
        }
        *PREVIOUS.lock().unwrap() = Some(SavedAction(prev));
    }
    debug!("signal: SIGSEGV trap handler installed");
    Ok(())
}

#[cfg(not(unix))]
pub fn install(_target: Weak<dyn TrapTarget>) -> Result<()> {
    Err(anyhow!("hardware traps are supported on unix only"))
}

/// Снять обработчик и вернуть предыдущую диспозицию. Повторный вызов — no-op.
#[cfg(unix)]
pub fn uninstall() {
    if !INSTALLED.load(Ordering::Acquire) {
        return;
    }
    restore_previous();

    let old = TARGET.swap(std::ptr::null_mut(), Ordering::AcqRel);
    while IN_HANDLER.load(Ordering::Acquire) != 0 {
        std::thread::yield_now();
    }
    if !old.is_null() {
        // SAFETY: указатель получен из Box::into_raw в install и больше никем не читается.
        unsafe { drop(Box::from_raw(old)) };
    }
    INSTALLED.store(false, Ordering::Release);
    debug!("signal: SIGSEGV trap handler removed");
}

#[cfg(not(unix))]
pub fn uninstall() {}

#[cfg(unix)]
fn restore_previous() {
    // Из обработчика сигнала замок может быть занят — тогда SIG_DFL.
    let guard = PREVIOUS.try_lock();
    // SAFETY: sigaction с сохранённой либо нулевой (SIG_DFL) структурой.
    unsafe {
        match guard {
            Ok(g) => match g.as_ref() {
                Some(prev) => {
                    libc::sigaction(libc::SIGSEGV, &prev.0, std::ptr::null_mut());
                }
                None => set_default(),
            },
            Err(_) => set_default(),
        }
    }
}

#[cfg(unix)]
unsafe fn set_default() {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
}

#[cfg(unix)]
extern "C" fn on_sigsegv(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: ядро передаёт валидный siginfo для SA_SIGINFO.
    let addr = unsafe { (*info).si_addr() as usize };

    IN_HANDLER.fetch_add(1, Ordering::AcqRel);
    let ptr = TARGET.load(Ordering::Acquire);
    let action = if ptr.is_null() {
        FaultAction::Forward
    } else {
        // SAFETY: uninstall освобождает цель только после выхода всех обработчиков.
        match unsafe { (*ptr).upgrade() } {
            Some(target) => target.on_trap(addr),
            None => FaultAction::Forward,
        }
    };
    IN_HANDLER.fetch_sub(1, Ordering::AcqRel);

    if action == FaultAction::Forward {
        restore_previous();
    }
}
