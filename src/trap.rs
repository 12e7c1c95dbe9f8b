//! Контракт ловушки: адрес первой записи -> действие.
//!
//! Логика решения живёт в Tracker::on_fault и не зависит от механизма доставки.
//! Доставка через SIGSEGV — в signal.rs; программные записи идут напрямую.

/// Итог обработки ловушки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Страница переведена в writable, запись можно повторить.
    Handled,
    /// Страница уже writable (обработал другой поток).
    Spurious,
    /// Адрес не наш: передать предыдущему обработчику / поведению по умолчанию.
    Forward,
}

impl FaultAction {
    #[inline]
    pub fn is_ours(self) -> bool {
        !matches!(self, FaultAction::Forward)
    }
}

/// Получатель аппаратных ловушек (реализуется движком).
pub trait TrapTarget: Send + Sync {
    /// Вызывается из обработчика сигнала с адресом ошибки.
    fn on_trap(&self, addr: usize) -> FaultAction;
}
