//! Session command: one-shot session inspection for manual testing.
//!
//! Local mode has no real browser, so the driver is seeded with a small
//! login page at the requested URL; the command then walks the same query
//! path an agent would: context, form-field discovery, screen content.

use std::sync::Arc;

use anyhow::Result;
use browsecast::capabilities::MockBrowserDriver;
use browsecast::config::{ServiceConfig, SessionConfig};
use browsecast::dom::{DomElement, DomSnapshot};

use super::local_stack;

pub async fn run(url: String, room: String) -> Result<()> {
    let stack = local_stack(ServiceConfig::default())?;

    let page = DomSnapshot::from_parts(
        &url,
        "Sign in",
        vec![
            DomElement::new("h1").text("Welcome back"),
            DomElement::new("input").input_type("email").name("email").placeholder("Email"),
            DomElement::new("input").input_type("password").name("password"),
            DomElement::new("button").text("Sign in"),
        ],
    );
    stack.drivers.script(Arc::new(MockBrowserDriver::with_page(page)));

    stack
        .manager
        .start_session(SessionConfig::new(&room).initial_url(&url).no_stream())
        .await?;

    let context = stack.manager.get_context(&room).await?;
    println!("room:      {}", context.room_name);
    println!("url:       {}", context.url);
    println!("title:     {}", context.title);
    println!("elements:  {}", context.element_count);
    println!("hash:      {}", context.content_hash);

    let fields = stack.manager.find_form_fields(&room).await?;
    println!(
        "form:      username={:?} password={:?} submit={:?}",
        fields.username_index, fields.password_index, fields.submit_index
    );

    let content = stack.manager.get_screen_content(&room).await?;
    if !content.visible_text.is_empty() {
        println!("--- visible text ---");
        println!("{}", content.visible_text);
    }

    stack.manager.close_session(&room).await?;
    Ok(())
}
