pub mod voucher;

pub use voucher::VoucherSigner;
