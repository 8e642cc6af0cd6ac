pub mod extract;
pub mod routes;
