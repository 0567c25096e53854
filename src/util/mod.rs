pub mod shell_quote;
