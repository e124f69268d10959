use obs_http::{ApiRequest, ObsClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let api_url = std::env::args().nth(1);
    let client = match ObsClient::from_env() {
        Ok(client) => client,
        Err(_) => ObsClient::from_default_oscrc(api_url.as_deref())?,
    };

    let configuration = client.get("/configuration").await?;
    println!("{}", configuration.text());

    let search = client
        .request(
            ApiRequest::get("/search/owner")
                .param("binary", "emacs")
                .param("filter", vec!["bugowner", "maintainer"]),
        )
        .await?;
    println!("{}", search.text());

    Ok(())
}
