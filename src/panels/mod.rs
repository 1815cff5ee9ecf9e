pub mod automation;
pub mod captcha;
pub mod registry;
pub mod traits;

pub use automation::{AutomationDriver, AutomationDriverFactory};
pub use captcha::{CaptchaSolver, TwoCaptchaSolver};
pub use registry::DriverRegistry;
pub use traits::{CreditOutcome, DriverFactory, DriverSecrets, PanelDriver, RetryPolicy};
