pub mod ept;
