pub mod order_logic;
