//! Chamber of Deputies open-data service (SOAP 1.1).

use std::sync::Arc;

use async_trait::async_trait;
use congreso_core::{Chamber, RawBill, RawParliamentarian, RawVoteEntry, RawVoteSession};
use congreso_storage::HttpRequest;
use quick_xml::escape::escape;
use tracing::debug;

use crate::xml::{parse_document, soap_body, XmlElement, XmlError};
use crate::{Coverage, FetchContext, SourceClient, SourceError, Transport, UpstreamRequest};

pub const NAMESPACE: &str = "http://opendata.camara.cl/camaradiputados/v1";
pub const DEFAULT_BASE_URL: &str = "https://opendata.camara.cl/camaradiputados/WServices";
pub const DEFAULT_COVERAGE: Coverage = Coverage {
    from: 2002,
    to: None,
};

const DEPUTY_SERVICE: &str = "WSDiputado.asmx";
const LEGISLATIVE_SERVICE: &str = "WSLegislativo.asmx";

pub const OP_DEPUTIES: &str = "retornarDiputadosPeriodoActual";
pub const OP_MOTIONS: &str = "retornarMocionesXAnno";
pub const OP_MESSAGES: &str = "retornarMensajesXAnno";
pub const OP_VOTES: &str = "retornarVotacionesXAnno";
pub const OP_VOTE_DETAIL: &str = "retornarVotacionDetalle";

pub struct CamaraClient {
    base_url: String,
    coverage: Coverage,
    transport: Arc<dyn Transport>,
}

impl CamaraClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            coverage: DEFAULT_COVERAGE,
            transport,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = coverage;
        self
    }

    fn request(
        &self,
        service: &str,
        operation: &'static str,
        params: Vec<(&'static str, String)>,
    ) -> UpstreamRequest {
        let url = format!("{}/{service}", self.base_url);
        let http = HttpRequest::soap(url, format!("{NAMESPACE}/{operation}"), soap_envelope(operation, &params));
        UpstreamRequest {
            source: Chamber::Camara,
            operation,
            params,
            http,
        }
    }

    async fn call(&self, ctx: &FetchContext, request: UpstreamRequest) -> Result<XmlElement, SourceError> {
        let body = self.transport.send(ctx, &request).await?;
        let root = parse_document(&body).map_err(|err| SourceError::parse(Chamber::Camara, err, &body))?;
        match soap_body(&root) {
            Ok(payload) => Ok(payload.clone()),
            Err(XmlError::Fault(reason)) => Err(SourceError::unavailable(
                Chamber::Camara,
                format!("soap fault from {}: {reason}", request.operation),
            )),
            Err(err) => Err(SourceError::parse(Chamber::Camara, err, &body)),
        }
    }
}

pub fn soap_envelope(operation: &str, params: &[(&'static str, String)]) -> String {
    let args: String = params
        .iter()
        .map(|(name, value)| format!("<{name}>{}</{name}>", escape(value.as_str())))
        .collect();
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<soap:Body><{op} xmlns="{ns}">{args}</{op}></soap:Body></soap:Envelope>"#
        ),
        op = operation,
        ns = NAMESPACE,
        args = args
    )
}

pub fn parse_deputies(payload: &XmlElement) -> Vec<RawParliamentarian> {
    payload
        .descendants("DiputadoPeriodo")
        .into_iter()
        .filter_map(|period| {
            let deputy = period.child("Diputado")?;
            let given = [deputy.text_at("Nombre"), deputy.text_at("Nombre2")]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            // Militancias are chronological; the last one is current.
            let party = deputy
                .find_all("Militancias/Militancia")
                .last()
                .and_then(|m| m.text_at("Partido/Nombre"));
            Some(RawParliamentarian {
                id: deputy.text_at("Id"),
                given_names: (!given.is_empty()).then_some(given),
                paternal_surname: deputy.text_at("ApellidoPaterno"),
                maternal_surname: deputy.text_at("ApellidoMaterno"),
                full_name: None,
                region: period.text_at("Distrito/Region"),
                district: period.text_at("Distrito/Numero"),
                party,
            })
        })
        .collect()
}

/// `default_initiative` fills in when the record omits its own type, which
/// is implied by the operation that listed it.
pub fn parse_bills(payload: &XmlElement, default_initiative: &str) -> Vec<RawBill> {
    payload
        .descendants("ProyectoLey")
        .into_iter()
        .map(|bill| RawBill {
            boletin: bill.text_at("NumeroBoletin"),
            title: bill.text_at("Nombre"),
            status: bill.text_at("Estado"),
            chamber_of_origin: bill.text_at("CamaraOrigen/Nombre"),
            urgency: bill.text_at("Urgencia"),
            initiative: bill
                .text_at("TipoIniciativa/Nombre")
                .or_else(|| Some(default_initiative.to_string())),
            entry_date: bill.text_at("FechaIngreso"),
        })
        .collect()
}

pub fn parse_vote_sessions(payload: &XmlElement) -> Vec<RawVoteSession> {
    payload
        .descendants("Votacion")
        .into_iter()
        .map(|vote| RawVoteSession {
            session_id: vote.text_at("Id"),
            boletin: vote.text_at("Boletin"),
            date: vote.text_at("Fecha"),
            description: vote.text_at("Descripcion"),
            yes: vote.text_at("TotalAfirmativos"),
            no: vote.text_at("TotalNegativos"),
            abstain: vote.text_at("TotalAbstenciones"),
            paired: vote.text_at("TotalDispensados"),
            quorum: vote.text_at("Quorum"),
            result: vote.text_at("Resultado"),
        })
        .collect()
}

pub fn parse_vote_detail(payload: &XmlElement, session_id: &str) -> Vec<RawVoteEntry> {
    payload
        .descendants("Voto")
        .into_iter()
        .map(|entry| RawVoteEntry {
            session_id: session_id.to_string(),
            parliamentarian_ref: entry.text_at("Diputado/Id"),
            parliamentarian_name: deputy_display_name(entry.child("Diputado")),
            option: entry.text_at("Opcion"),
        })
        .collect()
}

fn deputy_display_name(deputy: Option<&XmlElement>) -> Option<String> {
    let deputy = deputy?;
    let parts: Vec<String> = ["Nombre", "ApellidoPaterno", "ApellidoMaterno"]
        .iter()
        .filter_map(|field| deputy.text_at(field))
        .collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}

#[async_trait]
impl SourceClient for CamaraClient {
    fn source(&self) -> Chamber {
        Chamber::Camara
    }

    fn coverage(&self) -> Coverage {
        self.coverage
    }

    async fn fetch_parliamentarians(
        &self,
        ctx: &FetchContext,
    ) -> Result<Vec<RawParliamentarian>, SourceError> {
        let payload = self
            .call(ctx, self.request(DEPUTY_SERVICE, OP_DEPUTIES, vec![]))
            .await?;
        let deputies = parse_deputies(&payload);
        debug!(count = deputies.len(), "camara deputies fetched");
        Ok(deputies)
    }

    async fn fetch_bills(&self, ctx: &FetchContext, year: i32) -> Result<Vec<RawBill>, SourceError> {
        if !self.coverage.contains(year) {
            return Ok(Vec::new());
        }
        let params = vec![("prmAnno", year.to_string())];
        let motions = self
            .call(ctx, self.request(LEGISLATIVE_SERVICE, OP_MOTIONS, params.clone()))
            .await?;
        let messages = self
            .call(ctx, self.request(LEGISLATIVE_SERVICE, OP_MESSAGES, params))
            .await?;
        let mut bills = parse_bills(&motions, "Moción");
        bills.extend(parse_bills(&messages, "Mensaje"));
        debug!(year, count = bills.len(), "camara bills fetched");
        Ok(bills)
    }

    async fn fetch_vote_sessions(
        &self,
        ctx: &FetchContext,
        year: i32,
    ) -> Result<Vec<RawVoteSession>, SourceError> {
        if !self.coverage.contains(year) {
            return Ok(Vec::new());
        }
        let payload = self
            .call(
                ctx,
                self.request(LEGISLATIVE_SERVICE, OP_VOTES, vec![("prmAnno", year.to_string())]),
            )
            .await?;
        Ok(parse_vote_sessions(&payload))
    }

    async fn fetch_roll_call(
        &self,
        ctx: &FetchContext,
        session_id: &str,
    ) -> Result<Vec<RawVoteEntry>, SourceError> {
        let payload = self
            .call(
                ctx,
                self.request(
                    LEGISLATIVE_SERVICE,
                    OP_VOTE_DETAIL,
                    vec![("prmVotacionId", session_id.trim().to_string())],
                ),
            )
            .await?;
        Ok(parse_vote_detail(&payload, session_id))
    }
}
