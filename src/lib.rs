//! Gatekeeper: role-based access control with JWT authentication, an admin
//! REST API and templated email notifications.

pub mod admin;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod guard;
pub mod health;
pub mod models;
pub mod notification;
pub mod password;
pub mod rbac;
pub mod seed;
pub mod template_store;
pub mod templates;
pub mod token;
pub mod users;
pub mod validation;
pub mod web;
