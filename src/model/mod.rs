pub mod forecast;
pub mod price_bar;
pub mod symbol;
