//! Persistent Region: непрерывное анонимное отображение, поделённое на страницы PAGE_SIZE.
//!
//! - Память выделяется через memmap2 (MmapMut::map_anon), адрес выровнен по странице.
//! - Каждая страница либо read-only, либо writable. В программном режиме ловушек защита
//!   ведётся только в дескрипторах трекера; в аппаратном дублируется mprotect(2).
//! - Запись в регион идёт только через трекер (под замком дескриптора страницы) или
//!   из восстановления до включения защиты.

use anyhow::{anyhow, Context, Result};
use memmap2::{MmapMut, MmapOptions};

use crate::consts::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

pub struct Region {
    // Держит отображение живым; доступ идёт через base.
    _map: MmapMut,
    base: usize,
    page_count: usize,
    hardware: bool,
}

impl Region {
    /// Выделить регион на `page_count` страниц. `hardware` включает mprotect.
    pub fn new(page_count: usize, hardware: bool) -> Result<Self> {
        if page_count == 0 {
            return Err(anyhow!("region must have at least one page"));
        }
        if hardware {
            check_os_page_size()?;
        }
        let len = page_count
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| anyhow!("region size overflow: {} pages", page_count))?;
        let mut map = MmapOptions::new()
            .len(len)
            .map_anon()
            .with_context(|| format!("map anonymous region of {} bytes", len))?;
        let base = map.as_mut_ptr() as usize;
        if base % PAGE_SIZE != 0 {
            return Err(anyhow!("region base {:#x} is not page aligned", base));
        }
        Ok(Self {
            _map: map,
            base,
            page_count,
            hardware,
        })
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page_count == 0
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[inline]
    pub fn is_hardware(&self) -> bool {
        self.hardware
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len()
    }

    /// Номер страницы для адреса, если он внутри региона.
    #[inline]
    pub fn page_of(&self, addr: usize) -> Option<u64> {
        if self.contains(addr) {
            Some(((addr - self.base) / PAGE_SIZE) as u64)
        } else {
            None
        }
    }

    #[inline]
    pub fn page_addr(&self, page_id: u64) -> usize {
        self.base + page_id as usize * PAGE_SIZE
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(anyhow!(
                "range [{}, +{}) is outside the region ({} bytes)",
                offset,
                len,
                self.len()
            )),
        }
    }

    /// Скопировать байты региона в `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: диапазон проверен; отображение живо, пока жив self.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (self.base + offset) as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Скопировать страницу целиком в `dst` (dst.len() == PAGE_SIZE).
    pub fn copy_page(&self, page_id: u64, dst: &mut [u8]) {
        debug_assert!((page_id as usize) < self.page_count);
        debug_assert_eq!(dst.len(), PAGE_SIZE);
        // SAFETY: page_id < page_count, dst ровно на страницу.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.page_addr(page_id) as *const u8,
                dst.as_mut_ptr(),
                PAGE_SIZE,
            );
        }
    }

    /// Срез текущего содержимого страницы.
    ///
    /// # Safety
    /// Вызывающий держит замок дескриптора страницы либо иначе исключает
    /// одновременную запись в неё на время жизни среза.
    pub unsafe fn page_slice(&self, page_id: u64) -> &[u8] {
        std::slice::from_raw_parts(self.page_addr(page_id) as *const u8, PAGE_SIZE)
    }

    /// Записать байты без учёта защиты. В аппаратном режиме страницы должны быть writable.
    pub fn write_raw(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        // SAFETY: диапазон проверен; синхронизацию обеспечивает вызывающий (трекер).
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), (self.base + offset) as *mut u8, bytes.len());
        }
        Ok(())
    }

    /// Сменить защиту страницы. В программном режиме — no-op.
    pub fn protect(&self, page_id: u64, prot: Protection) -> Result<()> {
        self.protect_range(page_id, 1, prot)
    }

    pub fn protect_range(&self, first_page: u64, pages: usize, prot: Protection) -> Result<()> {
        if !self.hardware || pages == 0 {
            return Ok(());
        }
        mprotect_pages(self.page_addr(first_page), pages * PAGE_SIZE, prot)
            .with_context(|| format!("mprotect pages {}..+{} to {:?}", first_page, pages, prot))
    }
}

#[cfg(unix)]
fn check_os_page_size() -> Result<()> {
    // SAFETY: sysconf без побочных эффектов.
    let os = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if os as usize != PAGE_SIZE {
        return Err(anyhow!(
            "hardware traps need OS page size {} (got {})",
            PAGE_SIZE,
            os
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_os_page_size() -> Result<()> {
    Err(anyhow!("hardware traps are supported on unix only"))
}

#[cfg(unix)]
fn mprotect_pages(addr: usize, len: usize, prot: Protection) -> std::io::Result<()> {
    let flags = match prot {
        Protection::ReadOnly => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    // SAFETY: addr/len лежат внутри нашего отображения и выровнены по странице.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, flags) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn mprotect_pages(_addr: usize, _len: usize, _prot: Protection) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "mprotect is not available",
    ))
}
