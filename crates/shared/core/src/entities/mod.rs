mod account;
mod deal;
mod health;
mod market_data;
mod order;
mod position;
mod price;
mod specification;

pub use account::{AccountInformation, AccountMetrics};
pub use deal::{Deal, DealType};
pub use health::HealthStatus;
pub use market_data::{Book, BookEntry, BookEntryType, Candle, Tick};
pub use order::{Order, OrderState, OrderType};
pub use position::{Position, PositionType};
pub use price::SymbolPrice;
pub use specification::SymbolSpecification;
