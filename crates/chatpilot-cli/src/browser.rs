//! Chromium session driver for the chat site

use async_trait::async_trait;
use chatpilot_agent::{ChatSurface, Error, Observation, Profile, Result, SessionDriver};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{Config, Selectors, SiteSettings};

const WAIT_STEP: Duration = Duration::from_millis(250);
const CLEAR_INPUT_JS: &str = "function() { this.value = ''; }";

/// [`ChatSurface`] over one page of a running browser
pub struct BrowserSurface {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Page,
    site: SiteSettings,
    selectors: Selectors,
    delivery_pause: Duration,
}

impl BrowserSurface {
    fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.selectors.wait_timeout_secs)
    }

    /// First element matching `css`, if any
    async fn first(&self, css: &str) -> Result<Option<Element>> {
        let elements = self.page.find_elements(css).await.map_err(Error::surface)?;
        Ok(elements.into_iter().next())
    }

    /// Poll until `css` matches or the wait timeout passes
    async fn wait_for(&self, css: &str) -> Result<Element> {
        let timeout = self.wait_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(element) = self.first(css).await? {
                return Ok(element);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::surface(format!(
                    "element {:?} did not appear within {:?}",
                    css, timeout
                )));
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    async fn wait_text(&self, css: &str) -> Result<String> {
        let element = self.wait_for(css).await?;
        Ok(inner_text(&element).await?.trim().to_string())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        tracing::debug!(url, "navigate");
        self.page.goto(url).await.map_err(Error::surface)?;
        Ok(())
    }
}

async fn inner_text(element: &Element) -> Result<String> {
    Ok(element
        .inner_text()
        .await
        .map_err(Error::surface)?
        .unwrap_or_default())
}

/// The profile heading reads "Name, 27" with the age in a nested span
fn split_name_age(heading: &str, age: &str) -> String {
    if age.is_empty() {
        return heading.to_string();
    }
    heading
        .strip_suffix(age)
        .map(|name| name.trim_end_matches([',', ' ']).to_string())
        .unwrap_or_else(|| heading.to_string())
}

#[async_trait]
impl ChatSurface for BrowserSurface {
    async fn fetch_profile(&mut self, counterpart_id: &str) -> Result<Profile> {
        self.goto(&self.site.character_url(counterpart_id)).await?;

        let heading = self.wait_text(&self.selectors.profile_name).await?;
        let age = self.wait_text(&self.selectors.profile_age).await?;
        let bio = self.wait_text(&self.selectors.profile_bio).await?;

        Ok(Profile::new(split_name_age(&heading, &age), age, bio))
    }

    async fn open_conversation(&mut self, conversation_id: &str) -> Result<()> {
        self.goto(&self.site.chat_url(conversation_id)).await?;
        self.wait_for(&self.selectors.text_input).await?;
        self.wait_for(&self.selectors.send_button).await?;
        Ok(())
    }

    async fn read_latest(&mut self) -> Result<Observation> {
        let mut observation = Observation::default();

        let Some(block) = self.first(&self.selectors.latest_message).await? else {
            return Ok(observation);
        };
        let Some(message) = block
            .find_elements(&self.selectors.incoming_message)
            .await
            .map_err(Error::surface)?
            .into_iter()
            .next()
        else {
            return Ok(observation);
        };

        let paragraphs = message
            .find_elements(&self.selectors.message_paragraphs)
            .await
            .map_err(Error::surface)?;
        if let Some(text) = paragraphs.first() {
            observation.text = Some(inner_text(text).await?);
        }
        if let Some(time) = paragraphs.get(1) {
            observation.displayed_timestamp = Some(inner_text(time).await?);
        }

        let images = message
            .find_elements(&self.selectors.message_image)
            .await
            .map_err(Error::surface)?;
        if let Some(image) = images.first() {
            let src = image.attribute("src").await.map_err(Error::surface)?;
            observation.image_url = src.map(|src| self.site.image_url(&src));
        }

        Ok(observation)
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        let input = self
            .first(&self.selectors.text_input)
            .await?
            .ok_or_else(|| Error::surface("text input not found"))?;
        input
            .call_js_fn(CLEAR_INPUT_JS, false)
            .await
            .map_err(Error::surface)?;
        input.click().await.map_err(Error::surface)?;
        input.type_str(text).await.map_err(Error::surface)?;
        tokio::time::sleep(self.delivery_pause).await;
        input.press_key("Enter").await.map_err(Error::surface)?;
        Ok(())
    }

    async fn send_special(&mut self) -> Result<()> {
        let button = self
            .first(&self.selectors.send_button)
            .await?
            .ok_or_else(|| Error::surface("send button not found"))?;
        button.click().await.map_err(Error::surface)?;
        tokio::time::sleep(self.delivery_pause).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let closed = self.browser.close().await.map_err(Error::surface);
        if let Err(e) = self.browser.wait().await {
            tracing::debug!("browser did not exit cleanly: {}", e);
        }
        self.handler.abort();
        closed.map(|_| ())
    }
}

/// Launches Chromium on the persistent profile and opens the login page
pub struct BrowserDriver {
    executable: Option<PathBuf>,
    profile_dir: PathBuf,
    headless: bool,
    request_timeout: Duration,
    site: SiteSettings,
    selectors: Selectors,
    delivery_pause: Duration,
}

impl BrowserDriver {
    pub fn from_config(config: &Config) -> Self {
        Self {
            executable: config.browser.executable.clone(),
            profile_dir: config.browser_profile_dir(),
            headless: config.browser.headless,
            request_timeout: Duration::from_secs(config.browser.request_timeout_secs.max(1)),
            site: config.site.clone(),
            selectors: config.selectors.clone(),
            delivery_pause: Duration::from_millis(config.run.delivery_pause_ms),
        }
    }

    fn browser_config(&self) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(&self.profile_dir)
            .request_timeout(self.request_timeout);
        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }
        builder.build().map_err(Error::surface)
    }
}

#[async_trait]
impl SessionDriver for BrowserDriver {
    async fn open(&self) -> Result<Box<dyn ChatSurface>> {
        std::fs::create_dir_all(&self.profile_dir)?;
        let (mut browser, mut handler) = Browser::launch(self.browser_config()?)
            .await
            .map_err(Error::surface)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!("browser handler stopped: {}", e);
                    break;
                }
            }
        });
        tracing::debug!(profile = %self.profile_dir.display(), "browser launched");

        let page = match browser.new_page(self.site.login_url.as_str()).await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.close().await;
                handler.abort();
                return Err(Error::surface(e));
            }
        };

        Ok(Box::new(BrowserSurface {
            browser,
            handler,
            page,
            site: self.site.clone(),
            selectors: self.selectors.clone(),
            delivery_pause: self.delivery_pause,
        }))
    }
}
