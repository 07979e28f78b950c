pub mod gateway;
pub mod rest;
pub mod track;
